use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use gerber_raster::{render_file, GerberError, RenderOptions};

#[derive(Parser)]
#[command(name = "gerber-raster", about = "Rasterize a Gerber RS-274X layer to PNG")]
struct Cli {
    /// Input Gerber file.
    input: PathBuf,

    /// Output PNG path (defaults to the input with a .png extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output image width in pixels.
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Output image height in pixels.
    #[arg(long, default_value_t = 1024)]
    height: u32,

    /// Total margin as a fraction of each image dimension.
    #[arg(long, default_value_t = 0.10)]
    margin: f64,

    /// Antialias body fills.
    #[arg(long)]
    antialias: bool,
}

// Exit codes: 1 argument error, 2 open error, 3 parse error, 5 render
// error.
fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return ExitCode::from(1);
        }
    };

    if !cli.input.is_file() {
        eprintln!("error: cannot open {}", cli.input.display());
        return ExitCode::from(2);
    }

    let output = match cli.output {
        Some(path) => path,
        None => cli.input.with_extension("png"),
    };
    let options = RenderOptions {
        image_width: cli.width,
        image_height: cli.height,
        margin_fraction: cli.margin,
        antialias: cli.antialias,
        ..RenderOptions::default()
    };

    match render_file(&cli.input, &output, &options) {
        Ok(()) => {
            eprintln!("wrote {}", output.display());
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error}");
            let code = match error {
                GerberError::Io(_) => 2,
                GerberError::Lexical(_)
                | GerberError::Format { .. }
                | GerberError::Definition { .. }
                | GerberError::Termination(_) => 3,
                GerberError::Geometry { .. } | GerberError::Png(_) => 5,
            };
            ExitCode::from(code)
        }
    }
}
