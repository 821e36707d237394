use std::{fmt, path::PathBuf, str::FromStr};

use imagegen_engine::{SizeEncoding, SizePreset};

#[derive(Debug, clap::Parser)]
#[command(name = "imagegen", about = "Generate an image from a text prompt via ModelScope")]
pub struct Cli {
    /// What the image should show (English works best)
    pub prompt: String,

    /// ModelScope API key
    #[arg(short, long, env = "MODELSCOPE_API_KEY", hide_env_values = true)]
    pub key: String,

    #[arg(short, long, value_enum, default_value_t = SizePreset::Square)]
    pub preset: SizePreset,

    /// Explicit size as WxH, overrides --preset
    #[arg(long)]
    pub size: Option<Size>,

    /// Where to write the PNG
    #[arg(short, long, default_value = "ai_image.png")]
    pub output: PathBuf,

    /// RON file with generation options
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long, value_enum)]
    pub size_encoding: Option<SizeEncoding>,

    /// Overall deadline in seconds
    #[arg(long)]
    pub deadline: Option<u64>,

    /// Poll less often and wait longer before the first poll
    #[arg(long)]
    pub high_latency: bool,

    /// Submit the job again when it stays unknown to the remote for too long
    #[arg(long)]
    pub aggressive: bool,
}

impl Cli {
    pub fn dimensions(&self) -> (u32, u32) {
        match self.size {
            Some(Size { width, height }) => (width, height),
            None => self.preset.dimensions(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("{v:?} is not a positive integer"))
        };
        Ok(Size {
            width: parse(w)?,
            height: parse(h)?,
        })
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
