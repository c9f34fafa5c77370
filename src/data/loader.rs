//! Delimited-text matrix and label readers.
//!
//! Matrices are cells × genes tables: the header row holds the gene ids
//! (after a leading cell-id column) and each following row is one cell.
//! Plain files stay on disk and rows are fetched by byte offset; gzipped
//! files cannot be seeked and are decoded into memory instead.

use crate::data::{DenseMatrix, MatrixSource, RowAlignment};
use crate::error::{Result, SimsError};
use csv::{Position, ReaderBuilder, StringRecord};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(SimsError::data(path, "cannot determine format of gzipped file"))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(SimsError::data(path, "unsupported file format (expected csv/tsv, optionally .gz)")),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// An opened matrix file
pub struct MatrixFile {
    pub path: PathBuf,
    /// First-column cell identifiers, one per row
    pub cell_ids: Vec<String>,
    pub matrix: Arc<dyn MatrixSource>,
}

impl std::fmt::Debug for MatrixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixFile")
            .field("path", &self.path)
            .field("rows", &self.matrix.n_rows())
            .field("genes", &self.matrix.n_cols())
            .finish()
    }
}

/// Open a matrix file, out of core when the format allows it
pub fn open_matrix<P: AsRef<Path>>(path: P) -> Result<MatrixFile> {
    let path = path.as_ref();
    info!("Opening matrix {:?}", path);

    let format = FileFormat::from_path(path)?;
    debug!("Detected file format: {:?}", format);

    let (cell_ids, matrix): (Vec<String>, Arc<dyn MatrixSource>) = if format.is_gzipped() {
        let file = File::open(path)?;
        let (cells, dense) = read_dense(GzDecoder::new(file), format, path)?;
        (cells, Arc::new(dense))
    } else {
        let indexed = DelimitedMatrix::open(path, format)?;
        (indexed.cell_ids.clone(), Arc::new(indexed))
    };

    info!("Matrix {:?}: {} cells x {} genes", path, matrix.n_rows(), matrix.n_cols());
    Ok(MatrixFile {
        path: path.to_path_buf(),
        cell_ids,
        matrix,
    })
}

fn header_genes(headers: &StringRecord, path: &Path) -> Result<Vec<String>> {
    if headers.len() < 2 {
        return Err(SimsError::data(path, "header needs a cell id column and at least one gene"));
    }
    Ok(headers.iter().skip(1).map(|s| s.trim().to_string()).collect())
}

fn parse_row(record: &StringRecord, genes: &[String], path: &Path, row: usize) -> Result<Vec<f32>> {
    if record.len() != genes.len() + 1 {
        return Err(SimsError::data(
            path,
            format!("row {row} has {} fields, header has {}", record.len(), genes.len() + 1),
        ));
    }
    record
        .iter()
        .skip(1)
        .zip(genes)
        .map(|(field, gene)| {
            field.trim().parse::<f32>().map_err(|_| {
                SimsError::data(path, format!("row {row}, gene {gene}: {field:?} is not a number"))
            })
        })
        .collect()
}

fn read_dense<R: Read>(reader: R, format: FileFormat, path: &Path) -> Result<(Vec<String>, DenseMatrix)> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|e| SimsError::data(path, e.to_string()))?
        .clone();
    let genes = header_genes(&headers, path)?;

    let mut cells = Vec::new();
    let mut values = Vec::new();
    for (row, result) in csv_reader.records().enumerate() {
        let record = result.map_err(|e| SimsError::data(path, e.to_string()))?;
        cells.push(record.get(0).unwrap_or_default().to_string());
        values.extend(parse_row(&record, &genes, path, row)?);
    }

    Ok((cells, DenseMatrix::new(genes, values)?))
}

/// Plain delimited matrix read row by row from disk
pub struct DelimitedMatrix {
    path: PathBuf,
    genes: Vec<String>,
    cell_ids: Vec<String>,
    offsets: Vec<Position>,
    reader: Mutex<csv::Reader<BufReader<File>>>,
}

impl DelimitedMatrix {
    /// Scan the file once to index row offsets
    pub fn open<P: AsRef<Path>>(path: P, format: FileFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .from_reader(BufReader::new(File::open(&path)?));

        let headers = csv_reader
            .headers()
            .map_err(|e| SimsError::data(&path, e.to_string()))?
            .clone();
        let genes = header_genes(&headers, &path)?;

        let mut cell_ids = Vec::new();
        let mut offsets = Vec::new();
        let mut record = StringRecord::new();
        loop {
            let more = csv_reader
                .read_record(&mut record)
                .map_err(|e| SimsError::data(&path, e.to_string()))?;
            if !more {
                break;
            }
            if record.len() != genes.len() + 1 {
                return Err(SimsError::data(
                    &path,
                    format!(
                        "row {} has {} fields, header has {}",
                        offsets.len(),
                        record.len(),
                        genes.len() + 1
                    ),
                ));
            }
            if let Some(pos) = record.position() {
                offsets.push(pos.clone());
            }
            cell_ids.push(record.get(0).unwrap_or_default().to_string());
        }
        debug!("Indexed {} rows of {:?}", offsets.len(), path);

        let reader = ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(false)
            .from_reader(BufReader::new(File::open(&path)?));

        Ok(Self {
            path,
            genes,
            cell_ids,
            offsets,
            reader: Mutex::new(reader),
        })
    }

    /// Cell identifiers in row order
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }
}

impl MatrixSource for DelimitedMatrix {
    fn n_rows(&self) -> usize {
        self.offsets.len()
    }

    fn gene_ids(&self) -> &[String] {
        &self.genes
    }

    fn read_row(&self, row: usize) -> Result<Vec<f32>> {
        let pos = self.offsets.get(row).ok_or(SimsError::IndexOutOfRange {
            index: row,
            len: self.offsets.len(),
        })?;

        let mut record = StringRecord::new();
        {
            let mut reader = self
                .reader
                .lock()
                .map_err(|_| SimsError::Storage(format!("reader lock poisoned for {:?}", self.path)))?;
            reader
                .seek(pos.clone())
                .map_err(|e| SimsError::data(&self.path, e.to_string()))?;
            let found = reader
                .read_record(&mut record)
                .map_err(|e| SimsError::data(&self.path, e.to_string()))?;
            if !found {
                return Err(SimsError::data(&self.path, format!("row {row} vanished from file")));
            }
        }
        parse_row(&record, &self.genes, &self.path, row)
    }
}

/// Read a label column, optionally aligned to matrix rows by cell id.
///
/// Without `index_column` label entry `i` describes matrix row `i`. With
/// it, each entry's id is looked up in `cell_ids`.
pub fn load_labels<P: AsRef<Path>>(
    path: P,
    label_column: &str,
    index_column: Option<&str>,
    cell_ids: &[String],
) -> Result<(Vec<String>, RowAlignment)> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path)?;
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if format.is_gzipped() {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut csv_reader = ReaderBuilder::new()
        .delimiter(format.delimiter())
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| SimsError::data(path, e.to_string()))?
        .clone();

    let column = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| SimsError::data(path, format!("missing column {name:?}")))
    };
    let label_idx = column(label_column)?;
    let index_idx = index_column.map(column).transpose()?;

    let mut labels = Vec::new();
    let mut ids = Vec::new();
    for (row, result) in csv_reader.records().enumerate() {
        let record = result.map_err(|e| SimsError::data(path, e.to_string()))?;
        let label = record
            .get(label_idx)
            .ok_or_else(|| SimsError::data(path, format!("row {row} has no {label_column:?} field")))?;
        labels.push(label.trim().to_string());
        if let Some(idx) = index_idx {
            ids.push(record.get(idx).unwrap_or_default().trim().to_string());
        }
    }

    let alignment = match index_idx {
        None => RowAlignment::Identity,
        Some(_) => {
            let by_id: HashMap<&str, usize> = cell_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            if by_id.len() != cell_ids.len() {
                warn!("{:?}: matrix has duplicate cell ids, last occurrence wins", path);
            }
            let rows = ids
                .iter()
                .enumerate()
                .map(|(row, id)| {
                    by_id.get(id.as_str()).copied().ok_or_else(|| {
                        SimsError::data(path, format!("row {row}: cell {id:?} not found in matrix"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            RowAlignment::Explicit(rows)
        }
    };

    info!("Loaded {} labels from column {:?} of {:?}", labels.len(), label_column, path);
    Ok((labels, alignment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_file_format_detection() {
        assert_eq!(FileFormat::from_path("data.csv").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_path("data.tsv").unwrap(), FileFormat::Tsv);
        assert_eq!(FileFormat::from_path("data.csv.gz").unwrap(), FileFormat::GzippedCsv);
        assert_eq!(FileFormat::from_path("data.tsv.gz").unwrap(), FileFormat::GzippedTsv);
        assert!(matches!(FileFormat::from_path("data.h5ad"), Err(SimsError::Data { .. })));
    }

    #[test]
    fn test_out_of_core_rows() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "m.csv", "cell,G1,G2\nc1,1.0,2.0\nc2,3.5,4\nc3,0,0.25\n");

        let file = open_matrix(&path).unwrap();
        assert_eq!(file.cell_ids, vec!["c1", "c2", "c3"]);
        let m = &file.matrix;
        assert_eq!(m.gene_ids(), &["G1", "G2"]);
        assert_eq!(m.n_rows(), 3);

        // random access, out of order
        assert_eq!(m.read_row(2).unwrap(), vec![0.0, 0.25]);
        assert_eq!(m.read_row(0).unwrap(), vec![1.0, 2.0]);
        assert_eq!(m.read_row(1).unwrap(), vec![3.5, 4.0]);
        assert_eq!(m.read_row(2).unwrap(), vec![0.0, 0.25]);
        assert!(matches!(m.read_row(3), Err(SimsError::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_gzipped_tsv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.tsv.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"cell\tA\tB\tC\nx\t1\t2\t3\n").unwrap();
        enc.finish().unwrap();

        let file = open_matrix(&path).unwrap();
        assert_eq!(file.matrix.n_cols(), 3);
        assert_eq!(file.matrix.read_row(0).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_bad_value_names_row_and_gene() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "m.csv", "cell,G1,G2\nc1,1.0,oops\n");
        let file = open_matrix(&path).unwrap();
        let err = file.matrix.read_row(0).unwrap_err().to_string();
        assert!(err.contains("G2"));
        assert!(err.contains("oops"));
    }

    #[test]
    fn test_ragged_row_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "m.csv", "cell,G1,G2\nc1,1.0\n");
        assert!(open_matrix(&path).is_err());
    }

    #[test]
    fn test_labels_identity_and_indexed() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "l.csv", "cell,cell_type\nc3,B\nc1,A\n");
        let cells: Vec<String> = vec!["c1".into(), "c2".into(), "c3".into()];

        let (labels, alignment) = load_labels(&path, "cell_type", None, &cells).unwrap();
        assert_eq!(labels, vec!["B", "A"]);
        assert_eq!(alignment, RowAlignment::Identity);

        let (_, alignment) = load_labels(&path, "cell_type", Some("cell"), &cells).unwrap();
        assert_eq!(alignment, RowAlignment::Explicit(vec![2, 0]));

        assert!(load_labels(&path, "missing", None, &cells).is_err());
        let err = load_labels(&path, "cell_type", Some("cell"), &cells[..2]);
        assert!(matches!(err, Err(SimsError::Data { .. })));
    }
}
