pub mod cfk;
