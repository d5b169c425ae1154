pub mod audit;
pub mod cite;
pub mod diff;
pub mod download;
pub mod error;
pub mod eutils;
pub mod fetch;
pub mod filter;
pub mod search;
pub mod store;
