pub mod defer;
