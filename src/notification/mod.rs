pub mod controller;
pub mod feed;
pub mod model;
pub mod remote;
pub mod service;
pub mod toast;
