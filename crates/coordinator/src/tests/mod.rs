//! Round lifecycle tests against the in-memory ledger, store and leases

mod driver_test;
mod lifecycle_test;
mod recovery_test;
