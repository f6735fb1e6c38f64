// Adapters layer: concrete clients for the things a solver talks to
// (web targets, sockets and processes, chain nodes, the compiler, callbacks,
// CTF platforms).

pub mod ctfd;
pub mod ctftime;
pub mod http;
pub mod rpc;
pub mod server;
pub mod solc;
pub mod sqli;
pub mod tube;
