pub mod prelude;

pub mod images;
