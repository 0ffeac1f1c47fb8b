mod admission_tests;
mod invariant_tests;
#[cfg(feature = "journal")]
mod recovery_tests;
