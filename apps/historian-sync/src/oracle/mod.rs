pub mod client;
pub mod query;
pub mod session;
pub mod webapi;

pub use client::{OracleClient, RawTable};
pub use session::{OracleSession, SessionProvider};
pub use webapi::WebApiProvider;
