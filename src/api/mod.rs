pub mod client;
pub mod models;
pub mod mpd;

pub use client::CatalogClient;
