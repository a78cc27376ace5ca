/// Internal invariant assertions, compiled out entirely when the `checked`
/// feature is disabled (§7: "Internal checks ... are compiled-out in
/// release builds by a single feature toggle"). Unlike [`crate::Error`]
/// variants such as `BoundsCheck`, which are part of the public contract and
/// always enforced, these guard invariants that should never be reachable
/// from safe, well-behaved callers.
#[macro_export]
macro_rules! checked_assert {
    ($cond:expr, $($arg:tt)*) => {
        #[cfg(feature = "checked")]
        {
            debug_assert!($cond, $($arg)*);
        }
        #[cfg(not(feature = "checked"))]
        {
            let _ = || { let _ = $cond; };
        }
    };
}
