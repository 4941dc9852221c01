/// Reads the `LOOMRT_NUM_EXECUTORS` environment variable, used only by
/// [`crate::context::Context::from_env`]. The core library never consults
/// the environment itself -- `Context::new` always takes its executor count
/// as an explicit argument, matching `armd_context_create`'s own
/// `num_executors` parameter.
pub fn num_executors_from_env() -> Option<usize> {
    std::env::var("LOOMRT_NUM_EXECUTORS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n: &usize| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_is_none() {
        std::env::remove_var("LOOMRT_NUM_EXECUTORS");
        assert_eq!(num_executors_from_env(), None);
    }

    #[test]
    fn zero_is_rejected() {
        std::env::set_var("LOOMRT_NUM_EXECUTORS", "0");
        assert_eq!(num_executors_from_env(), None);
        std::env::remove_var("LOOMRT_NUM_EXECUTORS");
    }
}
