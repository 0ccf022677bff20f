use clap::{Parser, ValueEnum};
use std::process::ExitCode;

use tagjit::samples;
use tagjit::{ExecContext, TaggedValue};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum ListingFormat {
    #[default]
    Human,
    Json,
}

/// Compile the factorial-loop sample to native code and run it.
#[derive(Parser, Debug)]
#[command(name = "tagjit", version)]
struct Args {
    /// Parameter passed to the compiled function
    #[arg(long, default_value_t = 5.0)]
    param: f64,

    /// Pass the parameter as a heap-boxed number, forcing the general path
    #[arg(long)]
    boxed: bool,

    /// Print the annotated code listing before running
    #[arg(long)]
    listing: bool,

    /// Listing output format
    #[arg(long, value_enum, default_value_t = ListingFormat::Human)]
    format: ListingFormat,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let func = samples::factorial_loop();

    if args.listing {
        match args.format {
            ListingFormat::Human => {
                for line in func.listing() {
                    println!("{:#06x}  {}", line.offset, line.text);
                }
                println!("; {} bytes of code", func.code_len());
            }
            ListingFormat::Json => match serde_json::to_string_pretty(func.listing()) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("error: listing serialization failed: {err}");
                    return ExitCode::FAILURE;
                }
            },
        }
    }

    if cfg!(not(all(target_arch = "x86_64", unix))) {
        eprintln!("error: generated code targets x86-64 System V; not running on this host");
        return ExitCode::FAILURE;
    }

    let mut ctx = ExecContext::new();
    let param = if args.boxed {
        ctx.boxed_number(args.param)
    } else {
        TaggedValue::double(args.param)
    };
    ctx.set_args(&[param]);

    let result = unsafe { func.invoke(&mut ctx) };
    if result.is_double() {
        println!("{}", result.as_double());
    } else {
        println!("{result:?}");
    }

    ExitCode::SUCCESS
}
