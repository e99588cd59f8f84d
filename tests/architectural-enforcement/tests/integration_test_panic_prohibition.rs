//! Integration Test: Panic Prohibition
//!
//! **Policy**: Library code in `admission/core/src` propagates errors
//! instead of calling `unwrap()` or `expect()`. Lock poisoning cannot occur
//! with `parking_lot`, and every fallible path has an error variant.
//! Test modules and doc comments are exempt.

use architectural_enforcement::{admission_root, report, scan};

#[test]
fn test_no_unwrap_or_expect_in_core_library() {
    let core = vec![admission_root().join("core").join("src")];
    let violations = scan(&core, |_, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("unwrap()/expect() in admission-core library code", &violations);
}
