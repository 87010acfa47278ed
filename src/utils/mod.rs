pub mod constants;
pub mod rdconfig;
