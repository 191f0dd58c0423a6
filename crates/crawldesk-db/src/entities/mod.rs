//! Master database (`users`, `auth`) and per-tenant crawl result store
//! (`visited`, `html`, `images`). The result tables are owned by the crawl
//! worker and only read here.

pub mod auth;
pub mod html;
pub mod images;
pub mod users;
pub mod visited;
