use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Register a model version from a local artifact file
    Register(RegisterCommand),
    /// List registered models and their versions
    List,
    /// Delete a model version
    Delete(DeleteCommand),
}

#[derive(clap::Args)]
pub struct RegisterCommand {
    /// Model name, e.g. yolo_plant
    #[clap(long)]
    pub name: String,

    /// Version label, unique within the model
    #[clap(long)]
    pub version: String,

    /// Task type the version serves (detect, classify, ...)
    #[clap(long)]
    pub task: String,

    /// Artifact file (.pt, .pth, .safetensors, .bin, .onnx)
    #[clap(long)]
    pub file: PathBuf,

    /// Load parameters as a JSON object
    #[clap(long)]
    pub params: Option<String>,

    /// Free-form description
    #[clap(long)]
    pub description: Option<String>,
}

#[derive(clap::Args)]
pub struct DeleteCommand {
    /// Model name
    #[clap(long)]
    pub name: String,

    /// Version label
    #[clap(long)]
    pub version: String,
}
