use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "nestzip")]
#[command(version)]
#[command(about = "Browse and extract entries inside (nested) ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  nestzip -l outer.zip                      list the archive\n  \
  nestzip -l outer.zip/inner.zip            list an archive nested inside another\n  \
  nestzip -p outer.zip/inner.zip/a.txt      pipe one nested entry to stdout\n  \
  nestzip -d out outer.zip/docs             extract a subtree into out/")]
pub struct Cli {
    /// Path addressing an archive, or an entry inside one; archive
    /// components may be nested (outer.zip/inner.zip/file.txt)
    #[arg(value_name = "PATH")]
    pub path: String,

    /// List entries instead of extracting
    #[arg(short = 'l')]
    pub list: bool,

    /// Pipe entry contents to stdout, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract into DIR (default: current directory)
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Tolerate a preamble before the archive (self-extracting archives)
    #[arg(long)]
    pub preambled: bool,

    /// Tolerate arbitrary data after the archive
    #[arg(long)]
    pub postambled: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }
}
