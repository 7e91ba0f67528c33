/// Declares a static global `EMS_BUS` engine protected by a `critical_section` mutex.
///
/// This macro creates a `static` singleton `EMS_BUS` suitable for use in
/// interrupt-based environments, where both the main loop and the UART and
/// timer ISRs need to safely access the shared engine state.
///
/// # Arguments
/// - `$uart`: The concrete UART type (must implement `BusUart`)
/// - `$delay`: The concrete delay type (must implement `DelayNs`)
/// - `$sink`: The concrete device layer type (must implement `TelegramSink`)
///
/// # Example
/// ```rust,ignore
/// init_ems_bus!(MyUart, MyDelay, Devices);
/// ```
#[macro_export]
macro_rules! init_ems_bus {
    ( $uart:ty, $delay:ty, $sink:ty ) => {
        pub static EMS_BUS: $crate::timer::GlobalBusEngine<$uart, $delay, $sink> =
            $crate::timer::global_bus_engine_init();
    };
}

/// Builds and starts the global `EMS_BUS` engine.
///
/// Evaluates to the `Result` of [`BusEngine::start`](crate::engine::BusEngine::start).
/// Without a config argument the defaults of
/// [`BusConfig`](crate::engine::BusConfig) are used.
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     setup_ems_bus!(uart, delay, devices, config).unwrap();
/// }
/// ```
///
/// # Notes
/// - Requires `init_ems_bus!` to have been used earlier.
#[macro_export]
macro_rules! setup_ems_bus {
    ( $uart:expr, $delay:expr, $sink:expr, $config:expr ) => {
        $crate::timer::global_bus_engine_setup(&EMS_BUS, $uart, $delay, $sink, $config)
    };
    ( $uart:expr, $delay:expr, $sink:expr ) => {
        $crate::timer::global_bus_engine_setup(
            &EMS_BUS,
            $uart,
            $delay,
            $sink,
            $crate::engine::BusConfig::default(),
        )
    };
}

/// Calls `on_break()` on the global `EMS_BUS` if it has been set up.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn UART1() {
///     ems_on_break!();
/// }
/// ```
#[macro_export]
macro_rules! ems_on_break {
    () => {
        $crate::timer::global_bus_on_break(&EMS_BUS)
    };
}

/// Calls `on_tx_timer()` on the global `EMS_BUS` if it has been set up.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIMER1() {
///     ems_on_tx_timer!();
/// }
/// ```
#[macro_export]
macro_rules! ems_on_tx_timer {
    () => {
        $crate::timer::global_bus_on_tx_timer(&EMS_BUS)
    };
}

/// Runs one main-loop pass of the global `EMS_BUS`.
///
/// # Notes
/// - Safe to call before setup; it silently does nothing.
#[macro_export]
macro_rules! ems_loop_once {
    ( $now_ms:expr ) => {
        $crate::timer::global_bus_loop_once(&EMS_BUS, $now_ms)
    };
}
