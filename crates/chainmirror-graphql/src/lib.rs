//! chainmirror-graphql: Mina node event source over GraphQL.
//!
//! - [`MinaGraphqlSource`] implements [`chainmirror_core::ChainSource`]
//! - [`GraphqlClient`] posts `bestChain` and `syncStatus` queries over HTTP
//! - [`subscription::subscribe`] opens the `newBlock` WebSocket subscription

pub mod client;
pub mod queries;
pub mod source;
pub mod subscription;

pub use client::GraphqlClient;
pub use source::MinaGraphqlSource;
