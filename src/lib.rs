pub mod kdb3;
