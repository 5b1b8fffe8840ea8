use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Error};
use log::debug;
use structopt::StructOpt;

use ilweave::il::reader::read_module;
use ilweave::vm::{Interpreter, Options};
use ilweave::{MethodRef, Value, ValueType};

#[derive(StructOpt, Debug)]
#[structopt(name = "ilweave", about = "Stack-machine listing runner")]
struct Ilweave {
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Run a method from a listing and print its result
    #[structopt(name = "run")]
    Run {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
        /// Method to run; defaults to the last one in the file
        #[structopt(short = "e", long = "entry")]
        entry: Option<String>,
        #[structopt(long = "max-call-depth", default_value = "256")]
        max_call_depth: usize,
        args: Vec<String>,
    },
    /// Print the normalized listing
    #[structopt(name = "dump")]
    Dump {
        #[structopt(parse(from_os_str))]
        file: PathBuf,
    },
}

fn load(file: &Path) -> Result<Vec<MethodRef>, Error> {
    let source =
        fs::read_to_string(file).with_context(|| format!("could not read {}", file.display()))?;
    let methods =
        read_module(&source).with_context(|| format!("while reading {}", file.display()))?;
    debug!("read {} methods from {}", methods.len(), file.display());
    Ok(methods)
}

fn parse_arg(ty: ValueType, arg: &str) -> Result<Value, Error> {
    let value = match ty {
        ValueType::Int => Value::Int(arg.parse()?),
        ValueType::Float => Value::Float(arg.parse()?),
        ValueType::Bool => Value::Bool(arg.parse()?),
        ValueType::Str => Value::Str(arg.into()),
        ValueType::Any => {
            if let Ok(n) = arg.parse() {
                Value::Int(n)
            } else if let Ok(x) = arg.parse() {
                Value::Float(x)
            } else if let Ok(b) = arg.parse() {
                Value::Bool(b)
            } else {
                Value::Str(arg.into())
            }
        }
        _ => bail!("cannot pass a {} on the command line", ty),
    };
    Ok(value)
}

fn run_method(
    file: &Path,
    entry: Option<&str>,
    max_call_depth: usize,
    args: &[String],
) -> Result<(), Error> {
    let methods = load(file)?;
    let method = match entry {
        Some(name) => methods
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| anyhow!("no method named `{}` in {}", name, file.display()))?,
        None => methods
            .last()
            .ok_or_else(|| anyhow!("{} defines no methods", file.display()))?,
    };
    let signature = method.signature();
    if args.len() != signature.arity() {
        bail!(
            "{} takes {} arguments, got {}",
            method.name(),
            signature.arity(),
            args.len()
        );
    }
    let args = signature
        .params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (ty, arg))| {
            parse_arg(*ty, arg).with_context(|| format!("argument {} (`{}`) is not a {}", i, arg, ty))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut vm = Interpreter::new(Options {
        max_call_depth,
        ..Options::default()
    });
    let result = vm
        .invoke(method, args)
        .with_context(|| format!("while running {}", method.name()))?;
    if result != Value::Void {
        println!("{}", result);
    }
    Ok(())
}

fn dump(file: &Path) -> Result<(), Error> {
    for (i, method) in load(file)?.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print!("{}", method);
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();
    match Ilweave::from_args().command {
        Command::Run {
            file,
            entry,
            max_call_depth,
            args,
        } => run_method(&file, entry.as_deref(), max_call_depth, &args),
        Command::Dump { file } => dump(&file),
    }
}
