use clap::ValueEnum;

use kaiwa_ai::VertexAuthMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliVertexAuthMode {
    Auto,
    AccessToken,
    ServiceAccountKey,
    MetadataServer,
    Gcloud,
}

impl From<CliVertexAuthMode> for VertexAuthMode {
    fn from(value: CliVertexAuthMode) -> Self {
        match value {
            CliVertexAuthMode::Auto => VertexAuthMode::Auto,
            CliVertexAuthMode::AccessToken => VertexAuthMode::AccessToken,
            CliVertexAuthMode::ServiceAccountKey => VertexAuthMode::ServiceAccountKey,
            CliVertexAuthMode::MetadataServer => VertexAuthMode::MetadataServer,
            CliVertexAuthMode::Gcloud => VertexAuthMode::Gcloud,
        }
    }
}
