use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Curriculum catalog (YAML) replacing the built-in one.
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List catalog subjects as `id<TAB>nom`.
    Subjects,
    Synthesize(SynthesizeArgs),
    Render(RenderArgs),
    Objectives(ObjectivesArgs),
    /// Render a criterion-referenced evaluation for one unit.
    Evaluate(EvaluateArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LlmEngine {
    /// Deterministic partitioning only.
    Noop,
    /// OpenAI Responses API (`OPENAI_API_KEY`), with deterministic fallback.
    Openai,
}

#[derive(Debug, Args)]
pub struct SynthesizeArgs {
    /// Chapter list (JSON array, or `{"chapitres": [...]}`).
    #[arg(long)]
    pub chapters: String,

    /// Subject id (see `subjects`).
    #[arg(long)]
    pub subject: String,

    /// Grade band, e.g. `pei3`.
    #[arg(long)]
    pub grade: String,

    #[arg(long, default_value = "")]
    pub teacher: String,

    /// Number of units (default: the subject's `nb_unites`).
    #[arg(long)]
    pub units: Option<usize>,

    #[arg(long, value_enum, default_value_t = LlmEngine::Openai)]
    pub engine: LlmEngine,

    /// Output file path for the units JSON.
    #[arg(long)]
    pub out: String,

    /// Overwrite `--out` if it exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Units JSON written by `synthesize`.
    #[arg(long)]
    pub units: String,

    #[arg(long)]
    pub subject: String,

    #[arg(long)]
    pub grade: String,

    #[arg(long, default_value = "")]
    pub teacher: String,

    /// `.docx` template with `{field}` placeholders (default: built-in).
    #[arg(long)]
    pub template: Option<PathBuf>,

    #[arg(long)]
    pub out_dir: PathBuf,

    /// Render only this unit (0-based).
    #[arg(long)]
    pub index: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ObjectivesArgs {
    #[arg(long)]
    pub subject: String,

    #[arg(long)]
    pub grade: String,

    /// Objective tokens such as `A.i`.
    #[arg(required = true)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Units JSON written by `synthesize`.
    #[arg(long)]
    pub units: String,

    /// Unit to evaluate (0-based).
    #[arg(long, default_value_t = 0)]
    pub index: usize,

    #[arg(long)]
    pub subject: String,

    #[arg(long)]
    pub grade: String,

    /// Criterion letters, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "D")]
    pub criteria: Vec<String>,

    #[arg(long, value_enum, default_value_t = LlmEngine::Openai)]
    pub engine: LlmEngine,

    /// `.docx` evaluation template with `{field}` placeholders (default: built-in).
    #[arg(long)]
    pub template: Option<PathBuf>,

    /// Assessment descriptors (YAML) replacing the built-in ones.
    #[arg(long)]
    pub descriptors: Option<PathBuf>,

    #[arg(long)]
    pub out_dir: PathBuf,
}
