use std::fs;
use std::path::Path;

/// Interrupt entry points must not call `assert_invariant`, which takes the
/// invariant log Mutex.
#[test]
fn isr_does_not_call_assert_invariant() {
    let isr_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("src")
        .join("isr.rs");
    let src = fs::read_to_string(isr_path).expect("failed to read isr.rs");
    assert!(
        !src.contains("assert_invariant"),
        "ISR paths must not call assert_invariant (acquires Mutex)."
    );
    assert!(
        !src.contains(".rw.enter("),
        "ISR paths must not take the inter-core mutex."
    );
}
