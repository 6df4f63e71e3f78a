pub mod bindery;
