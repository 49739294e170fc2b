pub mod catalog;
pub mod pi_rest;
