//! Export contracts per module category and static structure checks

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use rhai::{ASTFlags, Stmt, AST};
use thiserror::Error;

/// Closing sentence of every upload-related failure message.
pub const UPLOAD_HINT: &str = "Please check your file and upload again.";

/// Kind of user upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Model definition
    Model,
    /// Dataset loader
    Dataset,
    /// Server strategy
    Strategy,
    /// Run configuration
    Config,
}

impl Category {
    /// All categories in loading order.
    pub const ALL: [Self; 4] = [Self::Model, Self::Dataset, Self::Strategy, Self::Config];

    /// Fixed cache name of the category's module.
    #[must_use]
    pub const fn module_name(&self) -> &'static str {
        match self {
            Self::Model => "user_model",
            Self::Dataset => "user_dataset",
            Self::Strategy => "user_algorithm",
            Self::Config => "user_config",
        }
    }

    /// Human label used in messages.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Strategy => "algorithm",
            Self::Config => "config",
        }
    }

    /// Category for a cache name such as `user_model`.
    #[must_use]
    pub fn from_module_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.module_name() == name)
    }

    /// Expected top-level functions.
    #[must_use]
    pub const fn functions(&self) -> &'static [&'static str] {
        match self {
            Self::Model => &["get_model"],
            Self::Dataset => &["load_data"],
            Self::Strategy => &["get_strategy"],
            Self::Config => &["get_config"],
        }
    }

    /// Expected top-level types: a constant map or a constructor function.
    #[must_use]
    pub const fn types(&self) -> &'static [&'static str] {
        match self {
            Self::Model => &["Net", "Model"],
            Self::Dataset | Self::Strategy | Self::Config => &[],
        }
    }

    /// Expected top-level variables.
    #[must_use]
    pub const fn variables(&self) -> &'static [&'static str] {
        match self {
            Self::Config => &["CONFIG", "config"],
            Self::Model | Self::Dataset | Self::Strategy => &[],
        }
    }

    /// Every expected export name, sorted.
    #[must_use]
    pub fn expected_exports(&self) -> Vec<&'static str> {
        let mut all: Vec<&'static str> = self
            .functions()
            .iter()
            .chain(self.types())
            .chain(self.variables())
            .copied()
            .collect();
        all.sort_unstable();
        all
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why an upload failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The file could not be read.
    #[error("Cannot read file: {0}")]
    Unreadable(String),

    /// The source does not parse.
    #[error("Syntax error in uploaded file (line {}): {message}", line.map_or_else(|| "?".to_string(), |l| l.to_string()))]
    Syntax {
        /// 1-based line of the offending token, when known.
        line: Option<usize>,
        /// Parser message.
        message: String,
    },

    /// None of the category's expected names is defined.
    #[error("File does not define any of the expected exports: {}. Please check your file and upload again.", expected.join(", "))]
    MissingExports {
        /// Sorted expected names.
        expected: Vec<String>,
    },
}

/// Why a module could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No path was given.
    #[error("no file path given")]
    EmptyPath,

    /// The file does not exist under the project root.
    #[error("File not found: {0}")]
    NotFound(String),

    /// Only script modules can be executed.
    #[error("Unsupported module type '{0}': expected a .rhai file")]
    UnsupportedType(String),

    /// Structural validation failed.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Copying into the module cache failed.
    #[error("Cannot cache module at {path}: {source}")]
    Cache {
        /// Cache destination.
        path: PathBuf,
        /// IO failure.
        source: std::io::Error,
    },

    /// Executing the module body raised.
    #[error("Error executing {path}: {message}")]
    Execution {
        /// Upload path.
        path: String,
        /// Script error.
        message: String,
    },
}

/// Top-level names a compiled module declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredNames {
    /// Script functions.
    pub functions: BTreeSet<String>,
    /// Top-level `const` declarations.
    pub constants: BTreeSet<String>,
    /// Top-level `let` declarations.
    pub variables: BTreeSet<String>,
}

impl DeclaredNames {
    /// Collect names from an AST without evaluating it.
    ///
    /// Every top-level declaration counts, whatever its initializer.
    #[must_use]
    pub fn from_ast(ast: &AST) -> Self {
        let mut names = Self::default();
        for f in ast.iter_functions() {
            names.functions.insert(f.name.to_string());
        }
        for stmt in ast.statements() {
            if let Stmt::Var(decl, flags, _) = stmt {
                let name = decl.0.name.to_string();
                if flags.contains(ASTFlags::CONSTANT) {
                    names.constants.insert(name);
                } else {
                    names.variables.insert(name);
                }
            }
        }
        names
    }

    fn binds(&self, name: &str) -> bool {
        self.constants.contains(name) || self.variables.contains(name)
    }

    /// Whether at least one of `category`'s exports is declared.
    ///
    /// Functions match function names; types match a function or any
    /// binding; variables match any binding.
    #[must_use]
    pub fn satisfies(&self, category: Category) -> bool {
        category.functions().iter().any(|f| self.functions.contains(*f))
            || category
                .types()
                .iter()
                .any(|t| self.functions.contains(*t) || self.binds(t))
            || category.variables().iter().any(|v| self.binds(v))
    }
}

/// Check compiled declarations against `category`'s contract.
///
/// # Errors
///
/// Returns [`ValidationError::MissingExports`] listing every expected name.
pub fn check_exports(ast: &AST, category: Category) -> Result<(), ValidationError> {
    if DeclaredNames::from_ast(ast).satisfies(category) {
        Ok(())
    } else {
        Err(ValidationError::MissingExports {
            expected: category
                .expected_exports()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }
}
