pub mod ioc;
pub mod retry;
pub mod text;
