//! Transport below the channels: Unix domain stream sockets.

mod socket;

pub use socket::{connect, generate_socket_path, SocketListener};

pub(crate) use socket::random_u64;
