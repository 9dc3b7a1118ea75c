pub mod line;
pub mod tcp;

pub use line::LineCollaborator;
pub use tcp::{TcpCollaborator, TcpConfig};
