pub mod coordination;
pub mod domain;
pub mod reference;
pub mod rpc;

pub use coordination::coordination_handlers;
pub use domain::{DomainContext, domain_handlers};
pub use reference::reference_handlers;
pub use rpc::{HandlerRegistry, PayloadHandler, spawn_request_loop};
