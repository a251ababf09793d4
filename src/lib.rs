pub mod app;
pub mod auths;
pub mod billing_rules;
pub mod cost;
pub mod db;
pub mod error;
pub mod funding;
pub mod groups;
pub mod handlers;
pub mod quota_fetch;
pub mod quota_poller;
pub mod refresh_tasks;
pub mod retention;
pub mod settings;
pub mod usage;
pub mod users;
