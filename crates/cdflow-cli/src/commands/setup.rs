use super::Pipeline;
use crate::GlobalArgs;

pub fn run(globals: &GlobalArgs) -> Result<u8, String> {
    let mut pipeline = Pipeline::open(globals)?;
    let result = pipeline.engine().setup();
    pipeline.finish("setup", "", "", result)
}
