pub mod config;
pub mod proxy;

pub use config::{Config, Fallback};
pub use proxy::{
    standard_multiplexer, Connection, ConnectionHandler, Handlers, HttpMatcher, Listener,
    ListenerConfig, ListenerStats, MatchResult, Multiplexer, MuxConfig, MuxError, Pipeline,
    ProtocolMatcher, Relay, StandardOptions, TlsMatcher,
};
