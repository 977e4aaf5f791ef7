use camino::Utf8PathBuf;

#[derive(clap::Parser)]
pub(crate) struct Cli {
    /// Configuration file
    #[clap(long, env = "JUKEBOXD_CONFIG")]
    pub(crate) config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    pub(crate) command: Commands,
}

#[derive(clap::Subcommand)]
pub(crate) enum Commands {
    /// Run the jukebox daemon
    Serve,
    /// Scan the collection roots into the track database, then exit
    Rescan,
}
