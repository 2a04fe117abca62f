use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use parquet::errors::ParquetError;

use stat2pqt::concurrency::ordered_parallel;
use stat2pqt::parquet::write_dataset;
use stat2pqt::{decode_with, Dataset, DecodeOptions, FileMetadata, Handler, HandlerResult, Variable};

pub mod cli;
use crate::cli::Args;

#[derive(Debug, thiserror::Error)]
enum ConvertError {
    #[error(transparent)]
    Decode(#[from] stat2pqt::Error),
    #[error("writing parquet: {0}")]
    Parquet(#[from] ParquetError),
}

/// Collects what `--info` prints.
#[derive(Default)]
struct Info {
    metadata: Option<FileMetadata>,
    variables: Vec<Variable>,
}

impl Handler for Info {
    fn on_metadata(&mut self, metadata: &FileMetadata) -> HandlerResult {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn on_variable(&mut self, _: usize, variable: &Variable, _: Option<stat2pqt::LabelSetId>) -> HandlerResult {
        self.variables.push(variable.clone());
        Ok(())
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let options = args.decode_options();
    let jobs = args
        .jobs
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));

    let mut failed = 0usize;
    ordered_parallel(
        args.infiles.iter(),
        |path| (path, run(path, &args, &options)),
        |(path, result)| match result {
            Ok(report) => print!("{report}"),
            Err(e) => {
                error!("{}: {e}", path.display());
                failed += 1;
            }
        },
        jobs,
    );
    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(path: &Path, args: &Args, options: &DecodeOptions) -> Result<String, ConvertError> {
    if args.info {
        let mut info = Info::default();
        decode_with(path, options, &mut info)?;
        Ok(describe(path, &info))
    } else {
        let out = out_path(path, args.outdir.as_deref());
        let mut dataset = Dataset::new();
        decode_with(path, options, &mut dataset)?;
        write_dataset(&out, &dataset, args.compression)?;
        info!(
            "{} -> {}: {} rows, {} variables",
            path.display(),
            out.display(),
            dataset.row_count(),
            dataset.var_count()
        );
        Ok(String::new())
    }
}

/// `data/x.sav` becomes `x.parquet` in `outdir`, or `data/x.parquet`.
fn out_path(path: &Path, outdir: Option<&Path>) -> PathBuf {
    let name = Path::new(path.file_name().unwrap_or(path.as_os_str())).with_extension("parquet");
    match outdir {
        Some(dir) => dir.join(name),
        None => path.with_extension("parquet"),
    }
}

fn describe(path: &Path, info: &Info) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "{}", path.display());
    if let Some(m) = &info.metadata {
        let _ = writeln!(
            s,
            "  {:?} {} version {}, {} rows, {} variables, {}, {:?}",
            m.format,
            m.kind.extension(),
            m.version,
            m.row_count,
            m.var_count,
            m.encoding,
            m.compression
        );
        if let Some(label) = &m.file_label {
            let _ = writeln!(s, "  label: {label}");
        }
        if let Some(name) = &m.table_name {
            let _ = writeln!(s, "  table: {name}");
        }
        if let Some(created) = m.created {
            let _ = writeln!(s, "  created: {created}");
        }
    }
    for v in &info.variables {
        let _ = writeln!(
            s,
            "  {:>4} {:<16} {:<10} {:<10} {:<8} {}",
            v.index,
            v.name,
            format!("{:?}", v.storage),
            v.print_format.as_deref().unwrap_or(""),
            v.measure,
            v.label.as_deref().unwrap_or("")
        );
    }
    s
}
