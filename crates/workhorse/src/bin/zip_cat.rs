//! `gitlab-zip-cat <archive.zip> <base64-entry>`
//!
//! Prints the decimal size of the requested entry terminated by a newline,
//! then the raw entry bytes, to stdout. Exits with a distinguished status
//! when the entry does not exist so the caller can answer 404.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use base64::Engine;
use clap::Parser;
use workhorse::artifacts::STATUS_ENTRY_NOT_FOUND;

#[derive(Parser)]
#[command(name = "gitlab-zip-cat")]
#[command(about = "Print one entry of a zip archive, prefixed by its size")]
struct Args {
    /// Path to the zip archive
    archive: PathBuf,
    /// Base64-encoded entry name
    entry: String,
}

enum ZipCatError {
    EntryNotFound(String),
    Other(String),
}

impl std::fmt::Display for ZipCatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZipCatError::EntryNotFound(entry) => write!(f, "entry {:?} not found", entry),
            ZipCatError::Other(err) => write!(f, "{}", err),
        }
    }
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => {}
        Err(err @ ZipCatError::EntryNotFound(_)) => {
            eprintln!("gitlab-zip-cat: {}", err);
            std::process::exit(STATUS_ENTRY_NOT_FOUND);
        }
        Err(err) => {
            eprintln!("gitlab-zip-cat: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<(), ZipCatError> {
    let name_bytes = base64::engine::general_purpose::STANDARD
        .decode(&args.entry)
        .map_err(|err| ZipCatError::Other(format!("decode entry name: {}", err)))?;
    let name = String::from_utf8(name_bytes)
        .map_err(|err| ZipCatError::Other(format!("entry name is not UTF-8: {}", err)))?;

    let file = File::open(&args.archive)
        .map_err(|err| ZipCatError::Other(format!("open {:?}: {}", args.archive, err)))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| ZipCatError::Other(format!("read zip central directory: {}", err)))?;

    let mut entry = match archive.by_name(&name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(ZipCatError::EntryNotFound(name));
        }
        Err(err) => return Err(ZipCatError::Other(format!("locate entry: {}", err))),
    };
    if entry.is_dir() {
        return Err(ZipCatError::EntryNotFound(name));
    }

    let stdout = io::stdout().lock();
    let mut out = BufWriter::new(stdout);
    writeln!(out, "{}", entry.size())
        .map_err(|err| ZipCatError::Other(format!("write size line: {}", err)))?;
    io::copy(&mut entry, &mut out)
        .map_err(|err| ZipCatError::Other(format!("stream entry: {}", err)))?;
    out.flush()
        .map_err(|err| ZipCatError::Other(format!("flush stdout: {}", err)))
}
