pub mod backup;
pub mod events;
pub mod factory;
pub mod logging;
pub mod notification;
