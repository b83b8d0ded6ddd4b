//! Real-time chat room served over WebSocket.
//!
//! Every connected client sees every message sent to the room after it
//! joined, in the order the room received them. Each module focuses on a
//! concrete responsibility:
//!
//! - [`message`] defines what travels through the room and the inbound wire shape.
//! - [`identity`] decodes the identity assertion the login flow attaches to
//!   each connection.
//! - [`hub`] owns room membership and fans messages out, one event at a time.
//! - [`client`] bridges one connection's stream to the hub with an inbound
//!   and an outbound task.
//! - [`acceptor`] upgrades HTTP requests to WebSockets and hands them to the hub.
//! - [`server`] ties a hub and its acceptor to a listener.
//! - [`cli`] parses the command-line interface; [`console`] is the terminal client.
//!
//! Integration tests drive the room through in-memory transports and through
//! real WebSocket connections.

pub mod acceptor;
pub mod cli;
pub mod client;
pub mod console;
pub mod hub;
pub mod identity;
pub mod message;
pub mod server;
