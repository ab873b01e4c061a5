//! Error handling foundation for copper-relay.
//!
//! Only the `Result` alias lives here. Each crate owns its domain error
//! enums; public entry points return `Report<E>` of their layer's error and
//! map lower errors into it.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }
}
