//! Table forest model
//!
//! A sync consumes a forest of [`Table`]s. Each table has [`Column`]s, a
//! [`TableResolver`] producing raw items, and optional child tables
//! ("relations") resolved once per parent row. Every resolved row becomes a
//! [`Resource`].

pub mod client;
pub mod column;
pub mod resolvers;
pub mod resource;
pub mod table;

pub use client::{Client, ClientRef, Multiplexer};
pub use column::{default_value, Column, ColumnResolver, ColumnType};
pub use resolvers::{
    FnColumnResolver, FnResolver, FnResourceHook, ParentColumnResolver, PathResolver,
    StaticResolver,
};
pub use resource::Resource;
pub use table::{ItemPage, ItemSender, ResourceHook, Table, TableResolver, Tables};
