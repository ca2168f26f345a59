pub mod identity;
pub mod verify_internal;
