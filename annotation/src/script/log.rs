use std::sync::{Arc, RwLock};

use ::log::Level;
use anyhow::Result;
use rune::{
    macros::{quote, FormatArgs, MacroContext, Quote, TokenStream},
    parse::Parser,
    Module,
};

const LEVELS: [(&str, Level); 5] = [
    ("trace", Level::Trace),
    ("debug", Level::Debug),
    ("info", Level::Info),
    ("warn", Level::Warn),
    ("error", Level::Error),
];

/// Log target of the rule whose policy is running, `policy::<rule>`.
#[derive(Debug, Clone)]
pub struct RuleTarget(Arc<RwLock<String>>);

impl Default for RuleTarget {
    fn default() -> Self {
        Self(Arc::new(RwLock::new("policy".to_string())))
    }
}

impl RuleTarget {
    pub fn enter(&self, rule: &str) {
        let mut target = self.0.write().unwrap_or_else(|err| err.into_inner());
        *target = format!("policy::{rule}");
    }

    pub fn get(&self) -> String {
        self.0.read().unwrap_or_else(|err| err.into_inner()).clone()
    }

    fn log(&self, level: Level, msg: &str) {
        let target = self.get();
        ::log::log!(target: target.as_str(), level, "{}", msg);
    }
}

/**
 * @Article Script Functions
 * ## Logging
 * `log::trace(msg: &str)` ... `log::error(msg: &str)`
 * `log::trace!(fmt, args..)` ... `log::error!(fmt, args..)`
 *
 * Messages are logged with the target `policy::<rule>` of the firing rule,
 * a log4rs logger for `policy` catches all of them.
 *
 * Example:
 * ```rune
 * log::info!("bypassing check at {:#x}", state.pc());
 * ```
 */
pub fn module(target: &RuleTarget) -> Result<Module> {
    let mut module = Module::with_crate("log");

    for (name, level) in LEVELS {
        let target = target.clone();
        module.function(&[name], move |msg: &str| target.log(level, msg))?;
    }

    // the expansion calls the plain function of the same level
    module.macro_(&["trace"], |ctx, stream| {
        expand_format(ctx, stream, |msg| quote!(log::trace(#msg)))
    })?;
    module.macro_(&["debug"], |ctx, stream| {
        expand_format(ctx, stream, |msg| quote!(log::debug(#msg)))
    })?;
    module.macro_(&["info"], |ctx, stream| {
        expand_format(ctx, stream, |msg| quote!(log::info(#msg)))
    })?;
    module.macro_(&["warn"], |ctx, stream| {
        expand_format(ctx, stream, |msg| quote!(log::warn(#msg)))
    })?;
    module.macro_(&["error"], |ctx, stream| {
        expand_format(ctx, stream, |msg| quote!(log::error(#msg)))
    })?;

    Ok(module)
}

fn expand_format<F>(
    ctx: &mut MacroContext<'_>,
    stream: &TokenStream,
    call: F,
) -> rune::Result<TokenStream>
where
    F: FnOnce(Quote<'_>) -> Quote<'_>,
{
    let mut parser = Parser::from_token_stream(stream, ctx.stream_span());
    let args = parser.parse_all::<FormatArgs>()?;
    let msg = args.expand(ctx)?;
    Ok(call(msg).into_token_stream(ctx))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn target_names_rule() {
        let target = RuleTarget::default();
        assert_eq!(target.get(), "policy");

        let shared = target.clone();
        shared.enter("bypass_license");
        assert_eq!(target.get(), "policy::bypass_license");
    }
}
