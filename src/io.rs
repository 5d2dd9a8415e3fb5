//! Reading training data and writing trained models.
//!
//! A data directory holds a `meta` file:
//!
//! ```text
//! <rows> <cols>
//! <nnz_train> <train_file>
//! <nnz_test> <test_file>      (optional)
//! ```
//!
//! The matrix files are either text triplets (`row col value`, 1-based) or PETSc
//! binary (big-endian, 0-based), see [`InputFormat`].

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use log::info;

use crate::config::{BiasMode, InputFormat, SolverType, TrainingParameters};
use crate::error::{PmfError, Result};
use crate::model::FactorModel;
use crate::sparse::{Entry, SparseMatrix};

/// Class id written at the start of a PETSc binary matrix
pub const PETSC_MAT_CLASSID: i32 = 1211216;

/// Upper bound on buffer space reserved from counts declared in file headers.
/// Larger inputs still load; the buffers grow as entries are read.
const MAX_RESERVED: usize = 1 << 20;

fn reserve_for<T>(declared: usize) -> Vec<T> {
    Vec::with_capacity(declared.min(MAX_RESERVED))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixFile {
    pub nnz: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaFile {
    pub rows: usize,
    pub cols: usize,
    pub train: MatrixFile,
    pub test: Option<MatrixFile>,
}

/// Train/test pair of one data directory
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: SparseMatrix,
    pub test: SparseMatrix,
}

fn parse_field<T: std::str::FromStr>(token: Option<&str>, what: &str, path: &Path) -> Result<T> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| PmfError::Format(format!("{}: missing or invalid {}", path.display(), what)))
}

fn parse_matrix_line(line: &str, dir: &Path, meta: &Path) -> Result<MatrixFile> {
    let mut tokens = line.split_whitespace();
    let nnz = parse_field(tokens.next(), "nnz", meta)?;
    let name: String = parse_field(tokens.next(), "file name", meta)?;
    Ok(MatrixFile {
        nnz,
        path: dir.join(name),
    })
}

pub fn read_meta(dir: &Path) -> Result<MetaFile> {
    let path = dir.join("meta");
    let content = fs::read_to_string(&path).map_err(|e| PmfError::io(&path, e))?;
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    let mut shape = lines.next().unwrap_or_default().split_whitespace();
    let rows = parse_field(shape.next(), "row count", &path)?;
    let cols = parse_field(shape.next(), "column count", &path)?;
    let train = match lines.next() {
        Some(line) => parse_matrix_line(line, dir, &path)?,
        None => {
            return Err(PmfError::Format(format!(
                "{}: no training matrix listed",
                path.display()
            )))
        }
    };
    let test = lines
        .next()
        .map(|line| parse_matrix_line(line, dir, &path))
        .transpose()?;
    Ok(MetaFile {
        rows,
        cols,
        train,
        test,
    })
}

/// Text triplets, one `row col value` per line with 1-based indices.
pub fn read_text_matrix(path: &Path, rows: usize, cols: usize, nnz: usize) -> Result<SparseMatrix> {
    let file = File::open(path).map_err(|e| PmfError::io(path, e))?;
    let mut entries = reserve_for(nnz);
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| PmfError::io(path, e))?;
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };
        let parse_err = || {
            PmfError::Format(format!(
                "{}:{}: expected `row col value`, got `{}`",
                path.display(),
                lineno + 1,
                line.trim()
            ))
        };
        let row: usize = first.parse().map_err(|_| parse_err())?;
        let col: usize = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(parse_err)?;
        let value: f64 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(parse_err)?;
        if row == 0 || col == 0 {
            return Err(PmfError::Format(format!(
                "{}:{}: indices are 1-based",
                path.display(),
                lineno + 1
            )));
        }
        entries.push(Entry::new(row - 1, col - 1, value));
    }
    if entries.len() != nnz {
        return Err(PmfError::Format(format!(
            "{}: declared {} entries, found {}",
            path.display(),
            nnz,
            entries.len()
        )));
    }
    SparseMatrix::from_triplets(rows, cols, entries)
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_f64<R: Read>(reader: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_be_bytes(buf))
}

fn non_negative(value: i32, what: &str, path: &Path) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| PmfError::Format(format!("{}: negative {} {}", path.display(), what, value)))
}

/// Parse a PETSc binary AIJ matrix from any reader.
pub fn parse_petsc<R: Read>(reader: &mut R, path: &Path) -> Result<SparseMatrix> {
    let classid = read_i32(reader)?;
    if classid != PETSC_MAT_CLASSID {
        return Err(PmfError::Format(format!(
            "{}: not a PETSc matrix (class id {})",
            path.display(),
            classid
        )));
    }
    let rows = non_negative(read_i32(reader)?, "row count", path)?;
    let cols = non_negative(read_i32(reader)?, "column count", path)?;
    let nnz = non_negative(read_i32(reader)?, "nnz", path)?;

    let mut row_counts = reserve_for(rows);
    for _ in 0..rows {
        row_counts.push(non_negative(read_i32(reader)?, "row length", path)?);
    }
    if row_counts.iter().sum::<usize>() != nnz {
        return Err(PmfError::Format(format!(
            "{}: row lengths do not add up to nnz {}",
            path.display(),
            nnz
        )));
    }
    let mut col_idx = reserve_for(nnz);
    for _ in 0..nnz {
        col_idx.push(non_negative(read_i32(reader)?, "column index", path)?);
    }
    let mut values = reserve_for(nnz);
    for _ in 0..nnz {
        values.push(read_f64(reader)?);
    }

    let rows_of_entries = row_counts
        .iter()
        .enumerate()
        .flat_map(|(r, &count)| std::iter::repeat(r).take(count));
    let entries = rows_of_entries
        .zip(col_idx)
        .zip(values)
        .map(|((r, c), v)| Entry::new(r, c, v));
    SparseMatrix::from_triplets(rows, cols, entries)
}

pub fn read_petsc_matrix(path: &Path, rows: usize, cols: usize, nnz: usize) -> Result<SparseMatrix> {
    let file = File::open(path).map_err(|e| PmfError::io(path, e))?;
    let matrix = parse_petsc(&mut BufReader::new(file), path)?;
    if matrix.rows() != rows || matrix.cols() != cols || matrix.nnz() != nnz {
        return Err(PmfError::Format(format!(
            "{}: holds a {}x{} matrix with nnz {}, meta declares {}x{} with nnz {}",
            path.display(),
            matrix.rows(),
            matrix.cols(),
            matrix.nnz(),
            rows,
            cols,
            nnz
        )));
    }
    Ok(matrix)
}

fn read_matrix(file: &MatrixFile, rows: usize, cols: usize, format: InputFormat) -> Result<SparseMatrix> {
    match format {
        InputFormat::Text => read_text_matrix(&file.path, rows, cols, file.nnz),
        InputFormat::Petsc => read_petsc_matrix(&file.path, rows, cols, file.nnz),
    }
}

/// Load the train/test pair listed in `dir/meta`. A missing test entry yields an
/// empty test matrix.
pub fn load_dataset(dir: &Path, format: InputFormat) -> Result<Dataset> {
    let meta = read_meta(dir)?;
    let train = read_matrix(&meta.train, meta.rows, meta.cols, format)?;
    let test = match &meta.test {
        Some(file) => read_matrix(file, meta.rows, meta.cols, format)?,
        None => SparseMatrix::empty(meta.rows, meta.cols),
    };
    info!(
        "loaded {}: {}x{}, train nnz {}, test nnz {}",
        dir.display(),
        meta.rows,
        meta.cols,
        train.nnz(),
        test.nnz()
    );
    Ok(Dataset { train, test })
}

/// `<basename(output_folder)>.model`; trailing separators are ignored.
pub fn default_model_name(output_folder: &Path) -> String {
    let base = output_folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!("{}.model", base)
}

/// Where the final factors go: `<model>.iter<maxiter>.final.{words,contexts}` for
/// the CCDR1 family, `<model>.{W,H}` otherwise.
pub fn final_output_paths(
    output: &Path,
    model_name: &str,
    solver: SolverType,
    maxiter: usize,
) -> (PathBuf, PathBuf) {
    if solver.is_ccdr1() {
        (
            output.join(format!("{}.iter{}.final.words", model_name, maxiter)),
            output.join(format!("{}.iter{}.final.contexts", model_name, maxiter)),
        )
    } else {
        (
            output.join(format!("{}.W", model_name)),
            output.join(format!("{}.H", model_name)),
        )
    }
}

/// `<model>.iter<n>.{words,contexts}`
pub fn iteration_output_paths(output: &Path, model_name: &str, iteration: usize) -> (PathBuf, PathBuf) {
    (
        output.join(format!("{}.iter{}.words", model_name, iteration)),
        output.join(format!("{}.iter{}.contexts", model_name, iteration)),
    )
}

/// `<prefix>.W.npy` / `<prefix>.H.npy`
pub fn npy_paths(prefix: &Path) -> (PathBuf, PathBuf) {
    let base = prefix.to_string_lossy();
    (
        PathBuf::from(format!("{}.W.npy", base)),
        PathBuf::from(format!("{}.H.npy", base)),
    )
}

pub fn params_path(output: &Path, model_name: &str) -> PathBuf {
    output.join(format!("{}.params.json", model_name))
}

pub fn write_embedding(
    model: &FactorModel,
    words: &Path,
    contexts: &Path,
    mode: BiasMode,
) -> Result<()> {
    let mut w = BufWriter::new(File::create(words).map_err(|e| PmfError::io(words, e))?);
    let mut h = BufWriter::new(File::create(contexts).map_err(|e| PmfError::io(contexts, e))?);
    model.save_embedding(&mut w, &mut h, mode)
}

pub fn write_params(path: &Path, params: &TrainingParameters) -> Result<()> {
    let file = File::create(path).map_err(|e| PmfError::io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), params)
        .map_err(|e| PmfError::Format(format!("{}: {}", path.display(), e)))
}
