//! Instrumentation helpers.

/// Logs how long `$block` took when the `stats` feature is enabled.
#[doc(hidden)]
#[macro_export]
macro_rules! timed {
    ($name:literal, $block:block) => {{
        #[cfg(feature = "stats")]
        {
            let start = std::time::Instant::now();
            let result = $block;
            ::bevy::log::info!("{} in {:?}", $name, start.elapsed());
            result
        }

        #[cfg(not(feature = "stats"))]
        {
            $block
        }
    }};
}
