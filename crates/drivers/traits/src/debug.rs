//! Debug macros for pciaccess subsystems
//!
//! These macros compile to nothing when debug features are disabled.

/// Debug print for bus enumeration and probing
#[macro_export]
#[cfg(feature = "debug-bus")]
macro_rules! debug_bus {
    ($($arg:tt)*) => {
        $crate::_debug_print("[BUS] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-bus"))]
macro_rules! debug_bus {
    ($($arg:tt)*) => {};
}

/// Debug print for capability list walking
#[macro_export]
#[cfg(feature = "debug-caps")]
macro_rules! debug_caps {
    ($($arg:tt)*) => {
        $crate::_debug_print("[CAPS] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-caps"))]
macro_rules! debug_caps {
    ($($arg:tt)*) => {};
}

/// Debug print for region mapping
#[macro_export]
#[cfg(feature = "debug-map")]
macro_rules! debug_map {
    ($($arg:tt)*) => {
        $crate::_debug_print("[MAP] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-map"))]
macro_rules! debug_map {
    ($($arg:tt)*) => {};
}

/// Debug print for the vendor/device name database
#[macro_export]
#[cfg(feature = "debug-names")]
macro_rules! debug_names {
    ($($arg:tt)*) => {
        $crate::_debug_print("[NAMES] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-names"))]
macro_rules! debug_names {
    ($($arg:tt)*) => {};
}

/// Debug print for the VGA arbiter client
#[macro_export]
#[cfg(feature = "debug-vgaarb")]
macro_rules! debug_vgaarb {
    ($($arg:tt)*) => {
        $crate::_debug_print("[VGAARB] ", format_args!($($arg)*))
    };
}

#[macro_export]
#[cfg(not(feature = "debug-vgaarb"))]
macro_rules! debug_vgaarb {
    ($($arg:tt)*) => {};
}

/// Debug output function, writes one prefixed line to stderr
#[doc(hidden)]
#[cfg(any(
    feature = "debug-bus",
    feature = "debug-caps",
    feature = "debug-map",
    feature = "debug-names",
    feature = "debug-vgaarb"
))]
pub fn _debug_print(prefix: &str, args: core::fmt::Arguments) {
    use std::io::Write;

    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    // Nothing sensible to do if stderr itself is gone
    let _ = writeln!(out, "{}{}", prefix, args);
}
