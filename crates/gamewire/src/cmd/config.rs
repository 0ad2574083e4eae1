use crate::cmd::ConfigArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_config, OutputFormat};

pub fn run(args: ConfigArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.settings.resolve()?;
    print_config(&config, format);
    Ok(SUCCESS)
}
