use crate::driver::BusUart;
use crate::engine::{BusConfig, BusEngine, TelegramSink};
use crate::error::ConfigError;
use core::cell::RefCell;
use critical_section::Mutex;
use embedded_hal::delay::DelayNs;

/// A `BusEngine` shared between the main loop and the UART/timer interrupts.
pub type GlobalBusEngine<U, D, S> = Mutex<RefCell<Option<BusEngine<U, D, S>>>>;

/// Used to initialize the global static `BusEngine` for use with
/// `critical_section`.
///
/// # Returns
/// * An empty mutable ref-cell
///
/// # Example
/// ```rust,ignore
/// use emsbus::timer::{GlobalBusEngine, global_bus_engine_init};
/// use some_hal::{Uart1, Delay};
///
/// static EMS_BUS: GlobalBusEngine<Uart1, Delay, Devices> = global_bus_engine_init();
/// ```
pub const fn global_bus_engine_init<U: BusUart, D: DelayNs, S: TelegramSink>()
-> GlobalBusEngine<U, D, S> {
    Mutex::new(RefCell::new(None))
}

/// Builds the engine inside the critical section and starts it.
///
/// # Arguments
/// * The global static `BusEngine`
/// * The UART, delay source and telegram sink
/// * The bus configuration
///
/// On a configuration error the global stays empty.
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     global_bus_engine_setup(&EMS_BUS, uart, delay, devices, BusConfig::default())?;
/// }
/// ```
pub fn global_bus_engine_setup<U: BusUart, D: DelayNs, S: TelegramSink>(
    global_engine: &'static GlobalBusEngine<U, D, S>,
    uart: U,
    delay: D,
    sink: S,
    config: BusConfig,
) -> Result<(), ConfigError> {
    critical_section::with(|cs| {
        let mut engine = BusEngine::new(uart, delay, sink);
        engine.start(config)?;
        let _ = global_engine.borrow(cs).replace(Some(engine));
        Ok(())
    })
}

/// Forwards the break-detect interrupt.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn UART1() {
///     global_bus_on_break(&EMS_BUS);
/// }
/// ```
pub fn global_bus_on_break<U: BusUart, D: DelayNs, S: TelegramSink>(
    global_engine: &'static GlobalBusEngine<U, D, S>,
) {
    critical_section::with(|cs| {
        if let Some(engine) = global_engine.borrow(cs).borrow_mut().as_mut() {
            engine.on_break();
        }
    });
}

/// Forwards the one-shot transmit timer interrupt.
pub fn global_bus_on_tx_timer<U: BusUart, D: DelayNs, S: TelegramSink>(
    global_engine: &'static GlobalBusEngine<U, D, S>,
) {
    critical_section::with(|cs| {
        if let Some(engine) = global_engine.borrow(cs).borrow_mut().as_mut() {
            engine.on_tx_timer();
        }
    });
}

/// Runs one main-loop iteration of the global engine.
///
/// The busy-wait dialects transmit from inside this call, so interrupts stay
/// masked for the length of one telegram.
pub fn global_bus_loop_once<U: BusUart, D: DelayNs, S: TelegramSink>(
    global_engine: &'static GlobalBusEngine<U, D, S>,
    now_ms: u32,
) {
    critical_section::with(|cs| {
        if let Some(engine) = global_engine.borrow(cs).borrow_mut().as_mut() {
            engine.loop_once(now_ms);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::mock::MockUart;
    use crate::telegram::Telegram;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    #[derive(Debug, Default)]
    struct Count(usize);

    impl TelegramSink for Count {
        fn on_telegram(&mut self, _telegram: &Telegram) {
            self.0 += 1;
        }
    }

    static EMS_BUS: GlobalBusEngine<MockUart, NoopDelay, Count> = global_bus_engine_init();

    #[test]
    fn test_global_engine_round_trip() {
        global_bus_on_break(&EMS_BUS);

        let bad = BusConfig {
            bus_id: 0,
            ..BusConfig::default()
        };
        assert_eq!(
            global_bus_engine_setup(&EMS_BUS, MockUart::new(), NoopDelay::new(), Count(0), bad),
            Err(ConfigError::InvalidBusId(0))
        );
        critical_section::with(|cs| assert!(EMS_BUS.borrow(cs).borrow().is_none()));

        let config = BusConfig {
            dialect: Dialect::Ht3,
            ..BusConfig::default()
        };
        global_bus_engine_setup(&EMS_BUS, MockUart::new(), NoopDelay::new(), Count(0), config)
            .unwrap();
        global_bus_on_break(&EMS_BUS);

        let frame = crate::telegram::seal(&[0x08, 0x00, 0x18, 0x00, 0x11]).unwrap();
        critical_section::with(|cs| {
            if let Some(engine) = EMS_BUS.borrow(cs).borrow_mut().as_mut() {
                let uart = engine.driver_mut().uart_mut();
                uart.feed(&frame);
                uart.feed(&[0x00]);
            }
        });
        global_bus_on_break(&EMS_BUS);
        global_bus_on_tx_timer(&EMS_BUS);
        global_bus_loop_once(&EMS_BUS, 0);

        critical_section::with(|cs| {
            let cell = EMS_BUS.borrow(cs).borrow();
            let engine = cell.as_ref().unwrap();
            assert_eq!(engine.sink().0, 1);
            assert_eq!(engine.telegram_count(), 1);
        });
    }
}
