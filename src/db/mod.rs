pub mod connection;
pub mod models;
pub mod schema;

pub use connection::{establish_connection, run_migrations, DbPool, DbPooledConnection};
pub use models::{
    Account, AccountStatusUpdate, Channel, EpgChannel, EpgProgram, EpgSource, EventLog, NewAccount,
    NewChannel, NewEpgChannel, NewEpgProgram, NewEpgSource, NewEventLog, NewStream, Setting, Stream,
};
