//! Logging shim: routes to `defmt` when the `defmt` feature is enabled,
//! compiles to nothing otherwise (so host-side tests link without a global
//! logger).

#[cfg(feature = "defmt")]
pub use defmt::{debug, error, info, trace, warn};

#[cfg(not(feature = "defmt"))]
macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {{ $(let _ = &$x;)* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {{ $(let _ = &$x;)* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {{ $(let _ = &$x;)* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! warn_shim {
    ($s:literal $(, $x:expr)* $(,)?) => {{ $(let _ = &$x;)* }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {{ $(let _ = &$x;)* }};
}

#[cfg(not(feature = "defmt"))]
pub(crate) use warn_shim as warn;

#[cfg(not(feature = "defmt"))]
pub(crate) use {debug, error, info, trace};
