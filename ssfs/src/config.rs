use url::Url;

/// The configuration settings that control how objects are read, written and archived.
///
/// When the `clap` feature is enabled this is also a `clap` parser, so that a CLI can flatten it
/// into its own arguments.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service like MinIO.  Path-style
    /// addressing is used for custom endpoints.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.
    ///
    /// If not set, the region is taken from the environment, falling back to `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub aws_region: Option<String>,

    /// The AWS access key ID to authenticate with.
    ///
    /// Must be specified together with `aws_secret_access_key`.  If neither is set, the default
    /// AWS credentials chain is used.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_secret_access_key")
    )]
    pub aws_access_key_id: Option<String>,

    /// The AWS secret access key to authenticate with.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_access_key_id")
    )]
    pub aws_secret_access_key: Option<String>,

    /// The part size used when uploading an object whose size isn't known in advance.
    ///
    /// Objects that turn out to be smaller than one part are uploaded with a single request.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The maximum number of concurrent requests to the bucket when uploading the parts of a
    /// single object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// The capacity of the in-memory pipe between a reader or writer handle and the background
    /// task transferring its data.
    ///
    /// Writers block when this much data is waiting to be uploaded, which bounds the memory used
    /// by every open handle.
    #[cfg_attr(feature = "clap", clap(long, default_value = "64KiB", global = true))]
    pub pipe_buffer_size: byte_unit::Byte,

    /// The gzip compression level for archives, from 0 (no compression) to 9 (best).
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "6", global = true, value_parser = clap::value_parser!(u32).range(0..=9))
    )]
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            pipe_buffer_size: byte_unit::Byte::from_bytes(64 * 1024),
            compression_level: 6,
        }
    }
}

impl Config {
    pub(crate) fn pipe_buffer_size(&self) -> usize {
        (self.pipe_buffer_size.get_bytes() as usize).max(1)
    }

    pub(crate) fn multipart_chunk_size(&self) -> usize {
        (self.multipart_chunk_size.get_bytes() as usize).max(1)
    }

    pub(crate) fn compression(&self) -> flate2::Compression {
        flate2::Compression::new(self.compression_level.min(9))
    }
}
