pub mod config;
pub mod controller;
pub mod feed;
pub mod humanize;
pub mod naming;
pub mod observability;
pub mod queue;
pub mod stages;
pub mod tools;
pub mod worker;
