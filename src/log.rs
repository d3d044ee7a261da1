#![allow(unused, reason = "logger")]

// Expands to nothing unless the `log` feature is enabled. Arguments stay type checked in a
// dead branch so disabled builds do not warn about unused bindings. Each expansion is a single
// block, usable as a statement or as a `()` expression.

macro_rules! trace {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false { let _ = format!($($tt)*); }
    }};
}

macro_rules! debug {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false { let _ = format!($($tt)*); }
    }};
}

macro_rules! info {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::info!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false { let _ = format!($($tt)*); }
    }};
}

macro_rules! warning {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false { let _ = format!($($tt)*); }
    }};
}

/// Alerts, reserved for broken invariants.
macro_rules! error {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::error!($($tt)*);
        #[cfg(not(feature = "log"))]
        if false { let _ = format!($($tt)*); }
    }};
}

pub(crate) use {trace, debug, info, warning, error};

#[cfg(test)]
mod test {
    use super::{debug, error, info, trace, warning};

    #[test]
    fn macros_as_expressions() {
        for n in 0..4 {
            let unit = match n {
                0 => trace!("zero"),
                1 => debug!("{n}"),
                2 => info!("n = {}", n),
                _ => error!("n = {n}"),
            };
            assert_eq!(unit, ());
        }
        let logged = Some(5).map(|n| warning!("{n}"));
        assert_eq!(logged, Some(()));
    }
}
