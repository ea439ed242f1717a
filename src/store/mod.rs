//! Mirror store — PostgreSQL persistence for credentials, watch
//! subscriptions, mirror records, and the processed-notification ledger.

pub mod db;

pub use db::MirrorStore;
