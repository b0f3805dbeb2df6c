//! Import of EMBA aggregator CSV files into the database.

pub mod csv_reader;
pub mod importer;

pub use csv_reader::{CsvDict, CsvValue, read_csv};
pub use importer::{f10_csv, f20_csv, f50_csv, result_read_in};
