use rustyscript::deno_core::{ModuleSpecifier, RequestedModuleType, ResolutionKind};
use rustyscript::deno_error::JsErrorBox;
use rustyscript::module_loader::ImportProvider as RustyScriptImportProvider;

/// The flat host binding, exposed as a module so scripts and the preamble
/// import one well-known specifier instead of poking globals.
const HOST_MODULE: &str = r#"
export const HOST = {
  ...globalThis.rustyscript.functions,
  ...globalThis.rustyscript.async_functions,
};
export default HOST;
"#;

#[derive(Default)]
pub struct ImportProvider;

impl RustyScriptImportProvider for ImportProvider {
  fn resolve(
    &mut self,
    specifier: &ModuleSpecifier,
    _referrer: &str,
    _kind: ResolutionKind,
  ) -> Option<Result<ModuleSpecifier, Error>> {
    log::trace!("resolve: {specifier:?}");

    // Specifier is just a URL.
    match specifier.scheme() {
      "file" | "andromeda" => {
        return Some(Ok(specifier.clone()));
      }
      scheme => {
        return Some(Err(anyhow!("Unsupported schema: '{scheme}'")));
      }
    };
  }

  fn import(
    &mut self,
    specifier: &ModuleSpecifier,
    _referrer: Option<&ModuleSpecifier>,
    _is_dyn_import: bool,
    _requested_module_type: RequestedModuleType,
  ) -> Option<Result<String, Error>> {
    log::trace!("import: {specifier:?}");

    match specifier.scheme() {
      "andromeda" => {
        return Some(Ok(HOST_MODULE.to_string()));
      }
      _ => {
        return None;
      }
    }
  }
}
