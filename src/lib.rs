pub mod admission;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod deferred;
pub mod epg;
pub mod m3u;
pub mod net;
pub mod observer;
pub mod probe;
pub mod profiles;
pub mod session;
pub mod supervisor;
pub mod server;
pub mod xmltv;
