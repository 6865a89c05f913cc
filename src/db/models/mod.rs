//! Database models split into domain-specific modules.

pub mod assessment;
pub mod availability;
pub mod backup;
pub mod class_session;
pub mod course;
pub mod notification;
pub mod payment;
pub mod user;

pub use assessment::*;
pub use availability::*;
pub use backup::*;
pub use class_session::*;
pub use course::*;
pub use notification::*;
pub use payment::*;
pub use user::*;
