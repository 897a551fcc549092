use proc_macro::TokenStream;
use proc_macro_error::{abort, proc_macro_error};
use quote::quote;
use syn::{
    parse_macro_input, punctuated::Punctuated, Expr, ExprArray, ItemStruct, Lit, LitStr, Meta,
    Token,
};

const NAME: &str = "name";
const PRIORITY: &str = "priority";
const REQUIRES: &str = "requires";
const AFTER: &str = "after";
const NO_REQUIREMENT: &str = "no_requirement";
const DEDICATED_WORKER: &str = "dedicated_worker";

/// Declares a struct as a generation unit and registers it in `genboard::UNITS`.
///
/// ```ignore
/// #[generation_unit(priority = 2, requires = ["heightMap"], dedicated_worker)]
/// #[derive(Default)]
/// pub struct Biomes;
/// ```
///
/// Attributes:
/// - `name = "..."`: unit id, defaults to the snake_case struct name
/// - `priority = N`: dispatch tier, defaults to 0
/// - `requires = ["key", ...]`: blackboard keys the unit waits for
/// - `no_requirement`: the unit is ready as soon as it is dispatched, even
///   when `after` is also given
/// - `after = ["unit", ...]`: units that must complete first
/// - `dedicated_worker`: run on a dedicated blocking worker
///
/// A unit that declares none of `requires`, `no_requirement` or `after`
/// never runs. The struct must implement `Default` and `GenerationUnit`.
#[proc_macro_attribute]
#[proc_macro_error]
pub fn generation_unit(attr: TokenStream, item: TokenStream) -> TokenStream {
    let attr_args =
        syn::parse::Parser::parse2(Punctuated::<Meta, Token![,]>::parse_terminated, attr.into())
            .unwrap_or_else(|e| abort!(e.span(), "Failed to parse generation_unit attributes: {}", e));

    let input = parse_macro_input!(item as ItemStruct);
    let struct_name = &input.ident;
    if !input.generics.params.is_empty() {
        abort!(input.generics, "generation_unit does not support generic structs");
    }

    let mut name = to_snake_case(&struct_name.to_string());
    let mut priority: Option<Expr> = None;
    let mut requires: Option<Vec<LitStr>> = None;
    let mut after: Option<Vec<LitStr>> = None;
    let mut no_requirement = false;
    let mut dedicated_worker = false;

    for meta in &attr_args {
        match meta {
            Meta::Path(path) if path.is_ident(NO_REQUIREMENT) => no_requirement = true,
            Meta::Path(path) if path.is_ident(DEDICATED_WORKER) => dedicated_worker = true,
            Meta::NameValue(nv) if nv.path.is_ident(NAME) => match &nv.value {
                Expr::Lit(expr_lit) => match &expr_lit.lit {
                    Lit::Str(lit) => name = lit.value(),
                    _ => abort!(expr_lit, "Expected a string literal for name"),
                },
                other => abort!(other, "Expected a string literal for name"),
            },
            Meta::NameValue(nv) if nv.path.is_ident(PRIORITY) => match &nv.value {
                // Negative priorities arrive as a unary minus expression
                Expr::Lit(_) | Expr::Unary(_) => priority = Some(nv.value.clone()),
                other => abort!(other, "Expected an integer for priority"),
            },
            Meta::NameValue(nv) if nv.path.is_ident(REQUIRES) => {
                requires = Some(string_list(&nv.value, REQUIRES));
            }
            Meta::NameValue(nv) if nv.path.is_ident(AFTER) => {
                after = Some(string_list(&nv.value, AFTER));
            }
            other => abort!(
                other,
                "Unknown generation_unit attribute; expected name, priority, requires, after, no_requirement or dedicated_worker"
            ),
        }
    }

    if no_requirement && requires.as_ref().is_some_and(|keys| !keys.is_empty()) {
        abort!(
            struct_name,
            "no_requirement and a non-empty requires list are mutually exclusive"
        );
    }

    let priority = priority.map_or_else(|| quote!(0), |expr| quote!(#expr));
    let no_requirement_call = no_requirement.then(|| quote!(.no_requirement()));
    let requires_call = requires.map(|keys| {
        if keys.is_empty() {
            quote!(.requires(::std::iter::empty::<&str>()))
        } else {
            quote!(.requires([#(#keys),*]))
        }
    });
    let after_call = after.map(|units| {
        if units.is_empty() {
            quote!(.after(::std::iter::empty()))
        } else {
            quote!(.after([#(#units),*]))
        }
    });
    let dedicated_call = dedicated_worker.then(|| quote!(.dedicated()));

    let expanded = quote! {
        #input

        impl #struct_name {
            pub const UNIT_ID: &'static str = #name;
        }

        impl ::genboard::UnitDeclaration for #struct_name {
            fn unit_id(&self) -> ::genboard::UnitId {
                #name
            }

            fn unit_spec(&self) -> ::genboard::UnitSpec {
                ::genboard::UnitSpec::new(#priority)
                    #no_requirement_call
                    #requires_call
                    #after_call
                    #dedicated_call
            }
        }

        const _: () = {
            #[::genboard::linkme::distributed_slice(::genboard::UNITS)]
            #[linkme(crate = ::genboard::linkme)]
            static LINKED_UNIT: ::genboard::LinkedUnit = ::genboard::LinkedUnit {
                id: #name,
                create: create_unit,
            };

            fn create_unit() -> ::std::boxed::Box<dyn ::genboard::GenerationUnit> {
                ::std::boxed::Box::new(<#struct_name as ::std::default::Default>::default())
            }
        };
    };

    TokenStream::from(expanded)
}

fn string_list(value: &Expr, attribute: &str) -> Vec<LitStr> {
    let Expr::Array(ExprArray { elems, .. }) = value else {
        abort!(value, "Expected a list of string literals for {}", attribute);
    };

    elems
        .iter()
        .map(|elem| match elem {
            Expr::Lit(expr_lit) => match &expr_lit.lit {
                Lit::Str(lit) => lit.clone(),
                _ => abort!(expr_lit, "Expected a string literal in {}", attribute),
            },
            other => abort!(other, "Expected a string literal in {}", attribute),
        })
        .collect()
}

fn to_snake_case(ident: &str) -> String {
    let mut snake = String::with_capacity(ident.len() + 4);
    let mut previous_lower = false;
    for ch in ident.chars() {
        if ch.is_uppercase() {
            if previous_lower {
                snake.push('_');
            }
            snake.extend(ch.to_lowercase());
            previous_lower = false;
        } else {
            snake.push(ch);
            previous_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    snake
}
