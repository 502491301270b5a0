// Integration tests driving whole billing cycles

pub mod billing_cycle;
