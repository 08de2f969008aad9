use super::Pipeline;
use crate::GlobalArgs;
use cdflow_core::DestroyArgs;

pub fn run(globals: &GlobalArgs, args: DestroyArgs) -> Result<u8, String> {
    let mut pipeline = Pipeline::open(globals)?;
    let result = pipeline.engine().destroy(&args);
    pipeline.finish("destroy", &args.env_name, &args.version, result)
}
