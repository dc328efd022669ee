use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Declares a pipeline step.
///
/// The annotated struct is the step's own config (`<module>.steps.<step>` by
/// default) and must provide
/// `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Declares a module: a named group of tasks sharing one config table.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn expr_type(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            !(p.is_ident("Task") || p.is_ident("Module"))
        })
        .cloned()
        .collect()
}

fn parse_key_values(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

struct TaskMeta {
    id: String,
    module: String,
    phase: String,
    config_path: String,
    provides: Vec<String>,
    after: Vec<String>,
    default_label: String,
}

fn default_step_path(struct_ident: &syn::Ident, id: &str, module: &str) -> syn::Result<String> {
    let Some(step) = id.strip_prefix(&format!("{module}.")) else {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: config_path omitted but id does not start with '<module>.'",
        ));
    };
    if step.is_empty() || step.contains('.') {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: id must be '<module>.<step>'",
        ));
    }
    Ok(format!("{module}.steps.{step}"))
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "module" => module = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "provides" => provides = expr_array_strings(&v)?,
            "after" => after = expr_array_strings(&v)?,
            "default_label" => default_label = Some(lit_str(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing id"))?;
    let module =
        module.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing module"))?;
    let phase = phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing phase"))?;
    let config_path = match config_path {
        Some(p) => p,
        None => default_step_path(&struct_ident, &id, &module)?,
    };

    let meta = TaskMeta {
        id,
        module,
        phase,
        config_path,
        provides,
        after,
        default_label: default_label
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing default_label"))?,
    };

    let TaskMeta {
        id: id_lit,
        module: module_lit,
        phase: phase_lit,
        config_path: config_path_lit,
        provides: provides_lits,
        after: after_lits,
        default_label: default_label_lit,
    } = meta;

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id_lit;
            pub const MODULE: &'static str = #module_lit;
            pub const PHASE: &'static str = #phase_lit;
            pub const CONFIG_PATH: &'static str = #config_path_lit;

            fn load_step(doc: &crate::config::ConfigDoc) -> crate::Result<Self> {
                let cfg: Self = doc
                    .deserialize_path::<Self>(#config_path_lit)?
                    .unwrap_or_default();
                if !cfg.enabled {
                    return Err(crate::Error::new(
                        crate::error::ErrorKind::Config,
                        format!("[{}].enabled=false is not allowed", #config_path_lit),
                    ));
                }
                Ok(cfg)
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = Self::load_step(doc)?;
                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label_lit.to_string());

                plan.add(crate::planner::Task {
                    id: #id_lit.to_string(),
                    label,
                    module: #module_lit.to_string(),
                    phase: #phase_lit.to_string(),
                    after: vec![#(#after_lits.to_string()),*],
                    provides: vec![#(#provides_lits.to_string()),*],
                })?;
                Ok(())
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg = Self::load_step(doc)?;
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

struct ModuleMeta {
    id: String,
    config_ty: syn::Type,
    config_path: String,
    tasks: Vec<syn::Path>,
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v, span) in parse_key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "config" => config_ty = Some(expr_type(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "tasks" => tasks = Some(expr_array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let meta = ModuleMeta {
        config_path: config_path.unwrap_or_else(|| id.clone()),
        id,
        config_ty: config_ty
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config"))?,
        tasks: tasks
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?,
    };

    let id_lit = meta.id;
    let config_ty = meta.config_ty;
    let config_path_lit = meta.config_path;
    let tasks = meta.tasks;

    let call_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id_lit
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path_lit)?
                    .unwrap_or_default();
                crate::modules::ModuleConfig::validate(&cfg)?;

                #(#call_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
