use anyhow::Result;
use liblxcri::runtime::Runtime;
use liblxcri::LxcriError;
use lxcri_cli::Delete;

pub fn delete(args: Delete, rt: &Runtime) -> Result<()> {
    let deadline = super::deadline(args.timeout, rt.timeouts.delete, "delete");
    match rt.delete(&args.container_id, args.force, &deadline) {
        // deleting a non-existing container is a noop, otherwise crio and
        // kubelet log warnings about it
        Err(LxcriError::NotExist) => Ok(()),
        result => Ok(result?),
    }
}
