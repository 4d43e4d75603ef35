use std::path::PathBuf;

use clap::Parser;

/// Compiler of OpenStreetMap data from osm.pbf format to a geoflat feature store
#[derive(Debug, Parser)]
#[clap(about, version, author)]
pub struct Args {
    /// Verbose mode (-v, -vv, -vvv, etc.)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Input OSM pbf file
    pub input: PathBuf,

    /// Output file for the geoflat blob
    pub output: PathBuf,

    /// Existing blob the input changes; locations of nodes missing from the
    /// input are looked up there
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Number of worker threads, all available cores by default
    #[arg(long)]
    pub cores: Option<usize>,

    /// Fail on features that don't validate, instead of dropping them
    #[arg(long = "fail-invalid")]
    pub fail_invalid: bool,

    /// Directory for scratch files, the directory of the output by default
    #[arg(long = "scratch-dir")]
    pub scratch_dir: Option<PathBuf>,
}
