use super::Pipeline;
use crate::GlobalArgs;
use cdflow_core::ShellArgs;

pub fn run(globals: &GlobalArgs, args: ShellArgs) -> Result<u8, String> {
    let mut pipeline = Pipeline::open(globals)?;
    let result = pipeline.engine().shell(&args);
    let version = args.version.as_deref().unwrap_or_default();
    pipeline.finish("shell", &args.env_name, version, result)
}
