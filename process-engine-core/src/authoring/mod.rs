pub mod dto;
pub mod validate;
pub mod yaml;
