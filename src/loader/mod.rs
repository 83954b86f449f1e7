//! Module Loader - validated, sandboxed loading of user uploads
//!
//! User model, dataset, strategy and config uploads are Rhai scripts.
//! Loading is parse-validate-then-execute:
//!
//! 1. The file is compiled to an AST and its top-level declarations are
//!    checked against the category's export contract ([`Category`]). Nothing
//!    runs at this stage.
//! 2. The file is copied to `{project_root}/.module_cache/{name}.rhai`
//!    under its category's fixed name.
//! 3. The cached copy is executed once in a fresh scope on a sandboxed
//!    engine; the resulting top-level bindings are kept with the module.
//!
//! Every failure degrades to "component missing, logged". Whether that is
//! fatal is decided by the orchestrator.
//!
//! ```rust,no_run
//! use fedlab::loader::{Category, Component, ModuleLoader};
//!
//! # fn main() -> fedlab::Result<()> {
//! let loader = ModuleLoader::new("/srv/project")?;
//! match loader.resolve("uploads/model.rhai", Category::Model) {
//!     Component::Model(factory) => println!("model from {}", factory.origin()),
//!     Component::Invalid(reason) => eprintln!("{reason}"),
//!     _ => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```

mod component;
mod config_file;
mod contract;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Scope, AST};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub use component::{Component, DatasetLoader, ModelFactory, StrategyFactory, StrategySpec};
pub use config_file::UserConfig;
pub use contract::{check_exports, Category, DeclaredNames, LoadError, ValidationError, UPLOAD_HINT};

use config_file::ConfigFormat;

use crate::{Error, Result};

/// Directory under the project root holding cached module copies.
pub const MODULE_CACHE_DIR: &str = ".module_cache";

/// Script file extension.
pub const MODULE_EXTENSION: &str = "rhai";

/// Build the engine user modules run on.
fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(5_000_000);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_string_size(1 << 20);
    engine.set_max_array_size(1 << 20);
    engine.set_max_map_size(1 << 16);
    engine.disable_symbol("eval");
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.on_print(|text| info!(target: "fedlab::script", "{text}"));
    engine.on_debug(|text, source, pos| {
        debug!(target: "fedlab::script", source = source.unwrap_or(""), ?pos, "{text}");
    });
    engine
}

/// A user module that passed validation and ran once.
pub struct LoadedModule {
    name: String,
    category: Category,
    source_path: PathBuf,
    cache_path: PathBuf,
    engine: Arc<Engine>,
    ast: AST,
    globals: Vec<(String, bool, Dynamic)>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("source_path", &self.source_path)
            .field("cache_path", &self.cache_path)
            .field(
                "globals",
                &self.globals.iter().map(|(n, _, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl LoadedModule {
    /// Cache name (`user_model`, ...).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Category the module was validated against.
    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    /// Uploaded file.
    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Cached copy that was executed.
    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Whether a top-level function `name` exists (any arity).
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.ast.iter_functions().any(|f| f.name == name)
    }

    /// Value of a top-level binding after execution; later bindings shadow
    /// earlier ones.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<&Dynamic> {
        self.globals
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, value)| value)
    }

    /// Call a script function in a fresh scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleExecution`] if the call raises or exceeds the
    /// sandbox limits.
    pub fn call(&self, function: &str, args: impl FuncArgs) -> Result<Dynamic> {
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &self.ast, function, args)
            .map_err(|e| self.execution_error(format!("{function}(): {e}")))
    }

    /// Convert a script value through `serde`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleExecution`] if the value has the wrong shape.
    pub fn convert<T: DeserializeOwned>(&self, what: &str, value: &Dynamic) -> Result<T> {
        let json = to_json(value).map_err(|e| self.execution_error(format!("{what}: {e}")))?;
        serde_json::from_value(json)
            .map_err(|e| self.execution_error(format!("{what} returned an unexpected value: {e}")))
    }

    pub(crate) fn execution_error(&self, message: String) -> Error {
        Error::ModuleExecution {
            module: self.name.clone(),
            message,
        }
    }
}

fn to_json(value: &Dynamic) -> std::result::Result<serde_json::Value, String> {
    rhai::serde::from_dynamic::<serde_json::Value>(value).map_err(|e| e.to_string())
}

/// Where a configuration comes from.
#[derive(Debug, Clone, Copy)]
pub enum ConfigSource<'a> {
    /// `.json`, `.yaml`/`.yml` or `.rhai` file, relative to the project root
    Path(&'a Path),
    /// Already-loaded config module
    Module(&'a LoadedModule),
}

impl<'a> From<&'a Path> for ConfigSource<'a> {
    fn from(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<&'a str> for ConfigSource<'a> {
    fn from(path: &'a str) -> Self {
        Self::Path(Path::new(path))
    }
}

impl<'a> From<&'a LoadedModule> for ConfigSource<'a> {
    fn from(module: &'a LoadedModule) -> Self {
        Self::Module(module)
    }
}

/// Loads user modules for one project root.
///
/// Loaded modules are cached by name for the lifetime of the loader.
/// Reloading a category overwrites both the cached file and the entry.
pub struct ModuleLoader {
    project_root: PathBuf,
    cache_dir: PathBuf,
    engine: Arc<Engine>,
    modules: DashMap<String, Arc<LoadedModule>>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("project_root", &self.project_root)
            .field("cache_dir", &self.cache_dir)
            .field("modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}

impl ModuleLoader {
    /// Create a loader and its cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the cache directory cannot be created.
    pub fn new(project_root: impl Into<PathBuf>) -> Result<Self> {
        let project_root = project_root.into();
        let cache_dir = project_root.join(MODULE_CACHE_DIR);
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            project_root,
            cache_dir,
            engine: Arc::new(sandboxed_engine()),
            modules: DashMap::new(),
        })
    }

    /// Project root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Module cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve `path` against the project root (absolute paths are kept).
    #[must_use]
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.project_root.join(path)
    }

    /// Check a file's declared names against `category` without running it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Syntax`] with the offending line when the
    /// source does not parse, or [`ValidationError::MissingExports`] when
    /// none of the expected names is declared.
    pub fn validate_structure(
        &self,
        path: impl AsRef<Path>,
        category: Category,
    ) -> std::result::Result<(), ValidationError> {
        let path = self.resolve_path(path);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| ValidationError::Unreadable(format!("{}: {e}", path.display())))?;
        let ast = self.compile(&source)?;
        check_exports(&ast, category)
    }

    fn compile(&self, source: &str) -> std::result::Result<AST, ValidationError> {
        self.engine.compile(source).map_err(|e| ValidationError::Syntax {
            line: e.position().line(),
            message: e.err_type().to_string(),
        })
    }

    /// Validate, cache and execute a module as `category`.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] describing the first step that failed.
    pub fn try_load_module(
        &self,
        path: impl AsRef<Path>,
        category: Category,
    ) -> std::result::Result<Arc<LoadedModule>, LoadError> {
        let upload = path.as_ref().display().to_string();
        if upload.trim().is_empty() {
            return Err(LoadError::EmptyPath);
        }
        let source_path = self.resolve_path(path.as_ref());
        if !source_path.is_file() {
            return Err(LoadError::NotFound(upload));
        }
        let extension = source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if extension != MODULE_EXTENSION {
            return Err(LoadError::UnsupportedType(extension.to_string()));
        }

        self.validate_structure(&source_path, category)?;

        let name = category.module_name();
        let cache_path = self.cache_dir.join(format!("{name}.{MODULE_EXTENSION}"));
        std::fs::copy(&source_path, &cache_path).map_err(|source| LoadError::Cache {
            path: cache_path.clone(),
            source,
        })?;
        let source = std::fs::read_to_string(&cache_path).map_err(|source| LoadError::Cache {
            path: cache_path.clone(),
            source,
        })?;

        let mut ast = self.compile(&source)?;
        ast.set_source(name);
        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| LoadError::Execution {
                path: upload.clone(),
                message: e.to_string(),
            })?;
        let globals = scope
            .iter()
            .map(|(n, is_const, value)| (n.to_string(), is_const, value))
            .collect();

        let module = Arc::new(LoadedModule {
            name: name.to_string(),
            category,
            source_path,
            cache_path,
            engine: Arc::clone(&self.engine),
            ast,
            globals,
        });
        info!(
            module = name,
            path = %upload,
            functions = module.ast.iter_functions().count(),
            "user module loaded"
        );
        self.modules.insert(name.to_string(), Arc::clone(&module));
        Ok(module)
    }

    /// [`ModuleLoader::try_load_module`], logging the failure and returning
    /// `None` instead.
    #[must_use]
    pub fn load_module(&self, path: impl AsRef<Path>, category: Category) -> Option<Arc<LoadedModule>> {
        match self.try_load_module(path.as_ref(), category) {
            Ok(module) => Some(module),
            Err(e) => {
                warn!(
                    category = %category,
                    path = %path.as_ref().display(),
                    error = %e,
                    "failed to load user module"
                );
                None
            }
        }
    }

    /// Module most recently loaded for `category`.
    #[must_use]
    pub fn cached(&self, category: Category) -> Option<Arc<LoadedModule>> {
        self.modules
            .get(category.module_name())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Model factory: `get_model`, else `Net`, else `Model`.
    #[must_use]
    pub fn extract_model(module: &Arc<LoadedModule>) -> Option<ModelFactory> {
        ModelFactory::resolve(Arc::clone(module))
    }

    /// `load_data` wrapper.
    #[must_use]
    pub fn extract_dataset_loader(module: &Arc<LoadedModule>) -> Option<DatasetLoader> {
        DatasetLoader::resolve(Arc::clone(module))
    }

    /// `get_strategy` wrapper.
    #[must_use]
    pub fn extract_strategy(module: &Arc<LoadedModule>) -> Option<StrategyFactory> {
        StrategyFactory::resolve(Arc::clone(module))
    }

    /// Configuration mapping from a file or a loaded module.
    ///
    /// Never fails: missing files, parse errors, and unsupported formats
    /// are logged and yield an empty mapping. A module yields its `CONFIG`
    /// or `config` binding, else the result of `get_config()`.
    #[must_use]
    pub fn extract_config<'a>(&self, source: impl Into<ConfigSource<'a>>) -> UserConfig {
        match source.into() {
            ConfigSource::Module(module) => Self::module_config(module),
            ConfigSource::Path(path) => self.file_config(path),
        }
    }

    fn file_config(&self, path: &Path) -> UserConfig {
        let resolved = self.resolve_path(path);
        if !resolved.is_file() {
            warn!(path = %path.display(), "config file not found");
            return UserConfig::new();
        }
        match ConfigFormat::from_path(&resolved) {
            Some(ConfigFormat::Json) => config_file::load_json(&resolved),
            Some(ConfigFormat::Yaml) => config_file::load_yaml(&resolved),
            Some(ConfigFormat::Script) => self
                .load_module(&resolved, Category::Config)
                .map(|module| Self::module_config(&module))
                .unwrap_or_default(),
            None => {
                warn!(path = %path.display(), "unsupported config format");
                UserConfig::new()
            }
        }
    }

    fn module_config(module: &LoadedModule) -> UserConfig {
        let origin = module.name().to_string();
        if let Some(value) = Category::Config
            .variables()
            .iter()
            .find_map(|name| module.global(name))
        {
            return match to_json(value) {
                Ok(json) => config_file::into_object(json, &origin),
                Err(e) => {
                    warn!(module = %origin, error = %e, "config binding is not convertible");
                    UserConfig::new()
                }
            };
        }
        if module.has_function("get_config") {
            return match module
                .call("get_config", ())
                .and_then(|value| module.convert::<serde_json::Value>("get_config", &value))
            {
                Ok(json) => config_file::into_object(json, &origin),
                Err(e) => {
                    warn!(module = %origin, error = %e, "get_config() failed");
                    UserConfig::new()
                }
            };
        }
        UserConfig::new()
    }

    /// Load `path` as `category` and extract its component.
    ///
    /// Config uploads always resolve (possibly to an empty mapping).
    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>, category: Category) -> Component {
        let path = path.as_ref();
        if category == Category::Config {
            return Component::Config(self.extract_config(path));
        }
        let module = match self.try_load_module(path, category) {
            Ok(module) => module,
            Err(e) => {
                warn!(category = %category, path = %path.display(), error = %e, "module resolution failed");
                return Component::Invalid(e.to_string());
            }
        };
        let component = match category {
            Category::Model => Self::extract_model(&module).map(Component::Model),
            Category::Dataset => Self::extract_dataset_loader(&module).map(Component::Dataset),
            Category::Strategy => Self::extract_strategy(&module).map(Component::Strategy),
            Category::Config => None,
        };
        component.unwrap_or_else(|| {
            Component::Invalid(format!(
                "No valid {category} found. Expected {}.",
                category.expected_exports().join(" or ")
            ))
        })
    }
}
