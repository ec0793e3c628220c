//! Per-run compilation context.
//!
//! Constructed fresh for every pipeline run and passed through every stage.
//! Identifier reservation lives here, so two compilations never share a
//! namespace.

use std::collections::HashSet;

use crate::config::HwConfig;
use crate::error::{CompileError, CompileResult, Stage};

#[derive(Debug)]
pub struct CompileContext {
    module_name: String,
    config: HwConfig,
    identifiers: HashSet<String>,
    stage: Option<Stage>,
}

impl CompileContext {
    pub fn new(module_name: &str, config: HwConfig) -> CompileResult<Self> {
        if module_name.is_empty() {
            return Err(CompileError::Config("module name must not be empty".into()));
        }
        config.validate()?;
        let mut identifiers = HashSet::new();
        identifiers.insert(module_name.to_string());
        Ok(CompileContext {
            module_name: module_name.to_string(),
            config,
            identifiers,
            stage: None,
        })
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    /// Stage currently running, if the pipeline has started.
    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        log::debug!("{}: entering {stage}", self.module_name);
        self.stage = Some(stage);
    }

    /// Reserve a unique identifier derived from `base` (`base`, `base_1`, `base_2`, ...).
    pub fn reserve(&mut self, base: &str) -> String {
        if self.identifiers.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if self.identifiers.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn is_reserved(&self, ident: &str) -> bool {
        self.identifiers.contains(ident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_makes_unique_names() {
        let mut ctx = CompileContext::new("top", HwConfig::default()).unwrap();
        assert_eq!(ctx.reserve("matmul"), "matmul");
        assert_eq!(ctx.reserve("matmul"), "matmul_1");
        assert_eq!(ctx.reserve("matmul"), "matmul_2");
        assert_eq!(ctx.reserve("top"), "top_1");
    }

    #[test]
    fn fresh_contexts_do_not_share_names() {
        let mut first = CompileContext::new("top", HwConfig::default()).unwrap();
        first.reserve("add");
        let mut second = CompileContext::new("top", HwConfig::default()).unwrap();
        assert!(!second.is_reserved("add"));
        assert_eq!(second.reserve("add"), "add");
    }

    #[test]
    fn invalid_config_rejected() {
        let config = HwConfig::default().with_chunk_size(0);
        assert!(CompileContext::new("top", config).is_err());
        assert!(CompileContext::new("", HwConfig::default()).is_err());
    }
}
