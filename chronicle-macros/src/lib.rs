// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromMeta, util::PathList};
use heck::{ToKebabCase, ToUpperCamelCase};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{DeriveInput, Ident, Path, parse_macro_input};

#[allow(clippy::doc_markdown, reason = "false positive")]
/// Build a PascalCase enum variant name from a type path.
fn path_to_pascal_ident(path: &Path) -> Ident {
    let combined = path
        .segments
        .iter()
        .map(|s| s.ident.to_string())
        .collect::<Vec<_>>()
        .join("_");
    let pascal = combined.to_upper_camel_case();
    let span = path
        .segments
        .last()
        .map_or_else(proc_macro2::Span::call_site, |segment| segment.ident.span());
    Ident::new(&pascal, span)
}

/// Returns the kind override or the default kebab-case name from the ident.
fn default_kind(ident: &Ident, kind: Option<String>) -> String {
    kind.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// `syn::Path` parsed from `key = Type`.
#[derive(Debug, Clone)]
struct TypePath(Path);

impl FromMeta for TypePath {
    fn from_meta(item: &syn::Meta) -> darling::Result<Self> {
        let error = || darling::Error::unsupported_shape("expected `key = Type`");
        let syn::Meta::NameValue(nv) = item else {
            return Err(error());
        };
        match syn::parse2::<syn::Type>(nv.value.to_token_stream()) {
            Ok(syn::Type::Path(type_path)) if type_path.qself.is_none() => {
                Ok(Self(type_path.path))
            }
            _ => Err(error()),
        }
    }
}

/// Configuration for the `#[aggregate(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(aggregate), supports(struct_any))]
struct AggregateArgs {
    ident: Ident,
    vis: syn::Visibility,
    id: TypePath,
    error: TypePath,
    events: PathList,
    #[darling(default)]
    kind: Option<String>,
    #[darling(default)]
    event_enum: Option<String>,
    #[darling(default)]
    derives: Option<PathList>,
    #[darling(default)]
    tenant_scoped: bool,
}

/// Configuration for the `#[event(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(event), supports(struct_any, enum_any))]
struct EventArgs {
    ident: Ident,
    #[darling(default)]
    kind: Option<String>,
}

/// Captures the event type path and its generated enum variant identifier.
struct EventSpec<'a> {
    path: &'a Path,
    variant: Ident,
}

impl<'a> EventSpec<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            variant: path_to_pascal_ident(path),
        }
    }
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Derives the `Aggregate` trait for a struct.
///
/// This macro generates:
/// - An event enum with one variant per event type
/// - `EventKind` and `EventSet` implementations, so the enum encodes and
///   decodes by event kind
/// - `From<E>` implementations for each event type
/// - `Aggregate` implementation that dispatches each variant to `Apply<E>`
///
/// Commands are handled via individual `Handle<C>` implementations.
///
/// # Attributes
///
/// ## Required
/// - `id = Type` - Aggregate ID type
/// - `error = Type` - Error type for command handling; must implement
///   `From<RuleViolation>`
/// - `events(Type1, Type2, ...)` - Event types
///
/// ## Optional
/// - `kind = "name"` - Aggregate type identifier (default: kebab-case struct
///   name)
/// - `event_enum = "Name"` - Override generated event enum name (default:
///   `{Struct}Event`)
/// - `derives(Trait1, Trait2, ...)` - Additional derives for the generated
///   event enum. Always includes `Clone`
/// - `tenant_scoped` - Persisted instances carry a tenant id
///
/// # Example
///
/// ```ignore
/// #[derive(Default, Aggregate)]
/// #[aggregate(
///     id = AccountId,
///     error = AccountError,
///     events(FundsDeposited, FundsWithdrawn),
///     derives(Debug, PartialEq, Eq)
/// )]
/// pub struct Account {
///     balance: i64,
/// }
/// ```
#[proc_macro_derive(Aggregate, attributes(aggregate))]
pub fn derive_aggregate(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_aggregate_impl(&input).into()
}

fn derive_aggregate_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<AggregateArgs, _>(input, |args| generate_aggregate_impl(args, input))
}

fn generate_aggregate_impl(args: AggregateArgs, input: &DeriveInput) -> TokenStream2 {
    let event_specs: Vec<EventSpec<'_>> = args.events.iter().map(EventSpec::new).collect();

    if event_specs.is_empty() {
        return darling::Error::custom("events(...) must contain at least one event type")
            .with_span(&input.ident)
            .write_errors();
    }

    let struct_name = &args.ident;
    let struct_vis = &args.vis;
    let id_type = &args.id.0;
    let error_type = &args.error.0;
    let tenant_scoped = args.tenant_scoped;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let kind = default_kind(struct_name, args.kind);

    let event_enum_name = args.event_enum.map_or_else(
        || Ident::new(&format!("{struct_name}Event"), struct_name.span()),
        |name| Ident::new(&name, struct_name.span()),
    );

    let event_types: Vec<&Path> = event_specs.iter().map(|spec| spec.path).collect();
    let variant_names: Vec<&Ident> = event_specs.iter().map(|spec| &spec.variant).collect();

    let user_derives = args.derives.unwrap_or_default();
    let derives = quote! { #[derive(Clone, #(#user_derives),*)] };

    quote! {
        #[doc = concat!("Event type for the [`", stringify!(#struct_name), "`] aggregate.")]
        #derives
        #struct_vis enum #event_enum_name {
            #(
                #[doc = concat!("[`", stringify!(#event_types), "`]")]
                #variant_names(#event_types)
            ),*
        }

        impl ::chronicle::event::EventKind for #event_enum_name {
            fn kind(&self) -> &'static str {
                match self {
                    #(Self::#variant_names(_) => <#event_types as ::chronicle::event::DomainEvent>::KIND),*
                }
            }
        }

        impl ::chronicle::codec::EventSet for #event_enum_name {
            const EVENT_KINDS: &'static [&'static str] =
                &[#(<#event_types as ::chronicle::event::DomainEvent>::KIND),*];

            fn encode<C: ::chronicle::codec::Codec>(
                &self,
                codec: &C,
            ) -> ::core::result::Result<::std::vec::Vec<u8>, C::Error> {
                match self {
                    #(Self::#variant_names(inner) => codec.serialize(inner)),*
                }
            }

            fn decode<C: ::chronicle::codec::Codec>(
                kind: &str,
                data: &[u8],
                codec: &C,
            ) -> ::core::result::Result<Self, ::chronicle::codec::EventDecodeError<C::Error>> {
                #(
                    if kind == <#event_types as ::chronicle::event::DomainEvent>::KIND {
                        return ::chronicle::codec::decode_variant(kind, data, codec)
                            .map(Self::#variant_names);
                    }
                )*
                ::core::result::Result::Err(::chronicle::codec::EventDecodeError::UnknownKind {
                    kind: kind.to_string(),
                    expected: <Self as ::chronicle::codec::EventSet>::EVENT_KINDS,
                })
            }
        }

        #(
            impl ::core::convert::From<#event_types> for #event_enum_name {
                fn from(event: #event_types) -> Self {
                    Self::#variant_names(event)
                }
            }
        )*

        impl #impl_generics ::chronicle::Aggregate for #struct_name #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            const TENANT_SCOPED: bool = #tenant_scoped;
            type Event = #event_enum_name;
            type Error = #error_type;
            type Id = #id_type;

            fn apply(&mut self, event: &Self::Event) {
                match event {
                    #(#event_enum_name::#variant_names(e) => ::chronicle::Apply::apply(self, e)),*
                }
            }
        }
    }
}

/// Derives `DomainEvent` for a struct or enum.
///
/// # Attributes
///
/// ## Optional
/// - `kind = "name"` - Stored event kind (default: kebab-case type name).
///   Changing it orphans already stored events.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, DomainEvent)]
/// #[event(kind = "funds-deposited.v2")]
/// pub struct FundsDeposited {
///     amount: i64,
/// }
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_domain_event_impl(&input).into()
}

fn derive_domain_event_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EventArgs, _>(input, |args| {
        let name = &args.ident;
        let kind = default_kind(name, args.kind);
        let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
        quote! {
            impl #impl_generics ::chronicle::event::DomainEvent for #name #ty_generics #where_clause {
                const KIND: &'static str = #kind;
            }
        }
    })
}
