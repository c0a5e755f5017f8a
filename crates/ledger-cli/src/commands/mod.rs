pub mod account;
pub mod category;
pub mod common;
pub mod inbox;
pub mod sync;
pub mod transaction;
