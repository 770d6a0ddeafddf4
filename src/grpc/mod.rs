pub mod convert;
pub mod dispatch_service;
pub mod raft_service;
pub mod server;

pub use server::GrpcServer;
