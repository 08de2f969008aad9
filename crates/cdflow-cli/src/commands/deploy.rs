use super::Pipeline;
use crate::GlobalArgs;
use cdflow_core::DeployArgs;

pub fn run(globals: &GlobalArgs, args: DeployArgs) -> Result<u8, String> {
    let mut pipeline = Pipeline::open(globals)?;
    let result = pipeline.engine().deploy(&args);
    pipeline.finish("deploy", &args.env_name, &args.version, result)
}
