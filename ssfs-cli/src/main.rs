use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::*;
use url::Url;

mod progress;

/// Read, write and archive objects in S3 buckets as if they were files
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ")"
))]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: ssfs::Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a single object
    #[clap(group(ArgGroup::new("output").required(true)))]
    Get {
        /// Write the object to a file
        #[clap(short = 'f', long, value_parser, group = "output")]
        file: Option<PathBuf>,

        /// Write the object to stdout
        #[clap(short = 't', long, group = "output")]
        stdout: bool,

        /// S3 URL of the object to download, ie `s3://foo/bar/baz.txt`
        #[clap(value_parser, value_name = "URL")]
        object: Url,
    },

    /// Upload a single object, replacing it if it already exists
    #[clap(group(ArgGroup::new("input").required(true)))]
    Put {
        /// Read the object's contents from a file
        #[clap(short = 'f', long, value_parser, group = "input")]
        file: Option<PathBuf>,

        /// Read the object's contents from stdin
        #[clap(short = 't', long, group = "input")]
        stdin: bool,

        /// S3 URL of the object to upload, ie `s3://foo/bar/baz.txt`
        #[clap(value_parser, value_name = "URL")]
        object: Url,
    },

    /// Show the size and modification time of an object
    Stat {
        /// S3 URL of the object, ie `s3://foo/bar/baz.txt`
        #[clap(value_parser, value_name = "URL")]
        object: Url,
    },

    /// Stream every object under a prefix as a gzipped tar archive
    #[clap(group(ArgGroup::new("output").required(true)))]
    Tar {
        /// Write the archive to a file
        #[clap(short = 'f', long, value_parser, group = "output")]
        file: Option<PathBuf>,

        /// Write the archive to stdout
        #[clap(short = 't', long, group = "output")]
        stdout: bool,

        /// S3 URL of the bucket and optional prefix to archive.
        ///
        /// Entries in the archive are named relative to the prefix.
        ///
        /// EXAMPLES:
        ///
        /// s3://foo/         - Archive all objects in the bucket `foo`
        ///
        /// s3://foo/bar/     - Archive all objects in the bucket `foo` with the prefix `bar/`
        #[clap(value_parser, value_name = "URL")]
        prefix: Url,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    debug!(?args, "Starting");

    let Args {
        command,
        globals,
        config,
    } = args;

    match command {
        Command::Get { file, object, .. } => get(&globals, config, file, &object).await,
        Command::Put { file, object, .. } => put(&globals, config, file, &object).await,
        Command::Stat { object } => stat(&globals, config, &object).await,
        Command::Tar { file, prefix, .. } => tar(&globals, config, file, &prefix).await,
    }
}

/// Log to stderr, since stdout can be carrying object data
fn init_logging(globals: &Globals) {
    let default_filter = if globals.verbose {
        "ssfs=debug,ssfs_cli=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Split an `s3://bucket/path` URL into the bucket name and the path within it
fn parse_s3_url(url: &Url) -> Result<(&str, &str)> {
    if url.scheme() != "s3" {
        return Err(eyre!("'{url}' is not an S3 URL; it must start with s3://"));
    }

    let bucket = url
        .host_str()
        .ok_or_else(|| eyre!("'{url}' doesn't specify a bucket"))?;

    Ok((bucket, url.path()))
}

async fn connect(globals: &Globals, config: ssfs::Config, bucket: &str) -> Result<ssfs::ObjectFs> {
    progress::with_spinner(
        globals,
        format!("Connecting to bucket '{bucket}'"),
        ssfs::ObjectFs::new(config, bucket),
    )
    .await
    .wrap_err_with(|| format!("Unable to access bucket '{bucket}'"))
}

async fn get(
    globals: &Globals,
    config: ssfs::Config,
    file: Option<PathBuf>,
    object: &Url,
) -> Result<()> {
    let (bucket, path) = parse_s3_url(object)?;
    let fs = connect(globals, config, bucket).await?;

    let mut reader = fs.open(path).await?;
    let size = reader.info().size;
    let output: Box<dyn Write + Send> = match &file {
        Some(file) => Box::new(
            File::create(file).wrap_err_with(|| format!("Unable to create {}", file.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    let bar = progress::transfer_bar(globals, Some(size), format!("Downloading {object}"));

    let copied = tokio::task::spawn_blocking(move || {
        let mut output = bar.wrap_write(output);
        let copied = std::io::copy(&mut reader, &mut output)?;
        output.flush()?;
        reader.close()?;
        bar.finish_and_clear();

        Result::<_>::Ok(copied)
    })
    .await??;

    info!(%object, bytes = copied, "Downloaded object");

    Ok(())
}

async fn put(
    globals: &Globals,
    config: ssfs::Config,
    file: Option<PathBuf>,
    object: &Url,
) -> Result<()> {
    let (bucket, path) = parse_s3_url(object)?;
    let fs = connect(globals, config, bucket).await?;

    let (input, size): (Box<dyn Read + Send>, Option<u64>) = match &file {
        Some(file) => {
            let input =
                File::open(file).wrap_err_with(|| format!("Unable to open {}", file.display()))?;
            let size = input.metadata().ok().map(|metadata| metadata.len());

            (Box::new(input), size)
        }
        None => (Box::new(std::io::stdin()), None),
    };

    let mut writer = fs.create(path).await?;
    let bar = progress::transfer_bar(globals, size, format!("Uploading {object}"));

    let info = tokio::task::spawn_blocking(move || {
        let mut input = bar.wrap_read(input);
        std::io::copy(&mut input, &mut writer)?;

        bar.set_message("Finishing upload");
        let info = writer.close()?;
        bar.finish_and_clear();

        Result::<_>::Ok(info)
    })
    .await??;

    info!(%object, bytes = info.size, "Uploaded object");
    if !globals.quiet {
        eprintln!(
            "Uploaded {object} ({})",
            byte_unit::Byte::from_bytes(info.size.into()).get_appropriate_unit(true)
        );
    }

    Ok(())
}

async fn stat(globals: &Globals, config: ssfs::Config, object: &Url) -> Result<()> {
    let (bucket, path) = parse_s3_url(object)?;
    let fs = connect(globals, config, bucket).await?;

    let info = fs.stat(path).await?;

    println!(
        "{}\t{}\t{:o}\t{}",
        info.key,
        info.size,
        info.mode(),
        info.modified_at.to_rfc3339()
    );

    Ok(())
}

async fn tar(
    globals: &Globals,
    config: ssfs::Config,
    file: Option<PathBuf>,
    prefix: &Url,
) -> Result<()> {
    let (bucket, path) = parse_s3_url(prefix)?;
    let fs = connect(globals, config, bucket).await?;

    let mut archive = progress::with_spinner(
        globals,
        format!("Listing objects in {prefix}"),
        fs.open_archive(path),
    )
    .await?;

    info!(%prefix, entries = archive.entries().len(), "Archiving objects");

    let output: Box<dyn Write + Send> = match &file {
        Some(file) => Box::new(
            File::create(file).wrap_err_with(|| format!("Unable to create {}", file.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };

    let bar = progress::transfer_bar(globals, None, format!("Archiving {prefix}"));

    let summary = tokio::task::spawn_blocking(move || {
        let mut output = bar.wrap_write(output);
        let copied = std::io::copy(&mut archive, &mut output);

        // Whatever happened to the copy, the archive must be closed so the producer stops; if the
        // copy failed, that is the error to report
        let summary = archive.close();
        copied?;
        output.flush()?;
        bar.finish_and_clear();

        Result::<_>::Ok(summary?)
    })
    .await??;

    info!(%prefix, entries = summary.entries, bytes = summary.bytes, "Archive complete");
    if !globals.quiet {
        eprintln!(
            "Archived {} objects ({}) from {prefix}",
            summary.entries,
            byte_unit::Byte::from_bytes(summary.bytes.into()).get_appropriate_unit(true)
        );
    }

    Ok(())
}
