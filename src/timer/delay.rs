use crate::driver::BusUart;
use crate::engine::{BusEngine, TelegramSink};
use embedded_hal::delay::DelayNs;

/// Runs a blocking loop that services the bus engine.
///
/// This is a simple polling loop for use in environments where the UART
/// break interrupt is unavailable or undesired. Each pass checks the raw
/// break status, runs one [`BusEngine::loop_once`] and sleeps.
///
/// # Arguments
/// - `engine`: A mutable reference to a started `BusEngine`.
/// - `delay`: A delay provider implementing `DelayNs`, typically from the HAL.
/// - `now_ms`: The free-running millisecond clock.
/// - `tick_us`: The delay between passes, in microseconds. It must stay well
///   below one byte time (1040 µs) or captures run together.
///
/// # Example
/// ```rust,ignore
/// use emsbus::timer::run_bus_loop;
/// run_bus_loop(&mut engine, &mut delay, || millis(), 500);
/// ```
///
/// # Notes
/// - This loop will never return; it is intended for single-purpose polling firmware.
/// - The timer-paced dialects still need the one-shot timer interrupt to call
///   [`BusEngine::on_tx_timer`]; prefer a busy-wait dialect here.
pub fn run_bus_loop<U, D, S, L, C>(
    engine: &mut BusEngine<U, D, S>,
    delay: &mut L,
    mut now_ms: C,
    tick_us: u32,
) -> !
where
    U: BusUart,
    D: DelayNs,
    S: TelegramSink,
    L: DelayNs,
    C: FnMut() -> u32,
{
    loop {
        engine.poll_break();
        engine.loop_once(now_ms());
        delay.delay_us(tick_us);
    }
}
