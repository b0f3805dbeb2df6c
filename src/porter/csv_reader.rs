use crate::error::EmbarkError;
use csv::ReaderBuilder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// One value of an EMBA key/value CSV: either a plain cell or a nested map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CsvValue {
    Text(String),
    Map(CsvDict),
}

pub type CsvDict = BTreeMap<String, CsvValue>;

impl CsvValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&CsvDict> {
        match self {
            Self::Map(m) => Some(m),
            Self::Text(_) => None,
        }
    }
}

/// Read a semicolon-delimited EMBA aggregator file into a nested dictionary.
pub fn read_csv(path: &Path) -> Result<CsvDict, EmbarkError> {
    let file = std::fs::File::open(path)?;
    let dict = read_csv_from(file)?;
    debug!(path = %path.display(), keys = dict.len(), "csv read in");
    Ok(dict)
}

pub fn read_csv_from<R: Read>(reader: R) -> Result<CsvDict, EmbarkError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut dict = CsvDict::new();
    for record in reader.records() {
        let mut row: Vec<String> = record?.iter().map(str::to_string).collect();
        // trailing delimiter, then a trailing NA marker
        if row.last().is_some_and(|c| c.is_empty()) {
            row.pop();
        }
        if row.last().is_some_and(|c| c == "NA") {
            row.pop();
        }
        insert_row(&mut dict, row);
    }
    Ok(dict)
}

fn insert_row(dict: &mut CsvDict, row: Vec<String>) {
    match row.len() {
        0 | 1 => {}
        2 => {
            let mut cells = row.into_iter();
            if let (Some(key), Some(value)) = (cells.next(), cells.next()) {
                dict.entry(key).or_insert(CsvValue::Text(value));
            }
        }
        len => {
            let entry = dict
                .entry(row[0].clone())
                .or_insert_with(|| CsvValue::Map(CsvDict::new()));
            // a key first seen as a plain pair keeps its text value
            let CsvValue::Map(section) = entry else {
                return;
            };

            if len > 3 {
                let sub = section
                    .entry(row[1].clone())
                    .or_insert_with(|| CsvValue::Map(CsvDict::new()));
                let CsvValue::Map(sub) = sub else {
                    return;
                };
                let pairs: CsvDict = (1..len - 1)
                    .step_by(2)
                    .map(|i| (row[i].clone(), CsvValue::Text(row[i + 1].clone())))
                    .collect();
                sub.insert(row[2].clone(), CsvValue::Map(pairs));
            } else {
                section.insert(row[1].clone(), CsvValue::Text(row[2].clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CsvValue {
        CsvValue::Text(s.to_string())
    }

    #[test]
    fn flat_pairs_first_value_wins() {
        let dict = read_csv_from("files;12;\nfiles;99;\nos_verified;Linux\n".as_bytes()).unwrap();
        assert_eq!(dict["files"], text("12"));
        assert_eq!(dict["os_verified"], text("Linux"));
    }

    #[test]
    fn trailing_empty_and_na_cells_are_dropped() {
        let dict = read_csv_from("entropy_value;7.55;NA;\nsingle;NA\n".as_bytes()).unwrap();
        assert_eq!(dict["entropy_value"], text("7.55"));
        // `single;NA` shrinks to one cell and is ignored
        assert!(!dict.contains_key("single"));
    }

    #[test]
    fn three_cells_build_a_section() {
        let dict = read_csv_from("canary;bin_a;yes\ncanary;bin_b;no\n".as_bytes()).unwrap();
        let section = dict["canary"].as_map().unwrap();
        assert_eq!(section["bin_a"], text("yes"));
        assert_eq!(section["bin_b"], text("no"));
    }

    #[test]
    fn longer_rows_build_pair_maps() {
        let dict =
            read_csv_from("strcpy_bin;busybox;12;arch;MIPS\n".as_bytes()).unwrap();
        let inner = dict["strcpy_bin"].as_map().unwrap()["busybox"]
            .as_map()
            .unwrap()["12"]
            .as_map()
            .unwrap();
        assert_eq!(inner["busybox"], text("12"));
        assert_eq!(inner["arch"], text("MIPS"));
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn text_key_is_not_replaced_by_section() {
        let dict = read_csv_from("os;Linux\nos;kernel;5.4\n".as_bytes()).unwrap();
        assert_eq!(dict["os"], text("Linux"));
    }

    #[test]
    fn blank_lines_are_ignored() {
        let dict = read_csv_from("\nfiles;3\n\n".as_bytes()).unwrap();
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn nested_values_serialize_as_json_objects() {
        let dict = read_csv_from("strcpy_bin;busybox;12\n".as_bytes()).unwrap();
        let json = serde_json::to_string(&dict["strcpy_bin"]).unwrap();
        assert_eq!(json, r#"{"busybox":"12"}"#);
    }
}
