extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Make this struct the prefilled prefix of a dynamic replay, specifically,
/// implement `PrefilledBuffers`.
///
/// Fields are passed in declaration order, so they must be declared in the
/// order the captured program allocated them.
///
/// ## Restrictions
/// - Only structs with named fields are supported.
/// - Each field's type must implement `cuda_graph::ReplayBuffer`.
///
/// ## Example
/// ```ignore
/// use cuda_graph::DevicePtr;
/// use cuda_graph_macro::ReplayBuffers;
///
/// #[derive(ReplayBuffers)]
/// struct Axpb {
///     x: (DevicePtr, usize),
///     y: (DevicePtr, usize),
/// }
/// ```
#[proc_macro_derive(ReplayBuffers)]
pub fn replay_buffers_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let st_data = if let Data::Struct(st_data) = input.data {
        st_data
    } else {
        panic!("`ReplayBuffers` only works with structs.");
    };

    let fields = if let Fields::Named(named) = st_data.fields {
        named
            .named
            .iter()
            .filter_map(|x| x.ident.clone())
            .collect::<Vec<_>>()
    } else {
        panic!("`ReplayBuffers` only works with structs that have named fields.");
    };

    let mut push_buffers = proc_macro2::TokenStream::new();
    for name in fields.iter() {
        quote_into::quote_into!(push_buffers += buffers.push((
            cuda_graph::ReplayBuffer::device_ptr(&self.#name),
            cuda_graph::ReplayBuffer::byte_len(&self.#name),
        ));)
    }

    let count = fields.len();
    let expanded = quote! {
        impl #impl_generics cuda_graph::PrefilledBuffers for #name #ty_generics #where_clause {
            fn prefilled(&self) -> Vec<(cuda_graph::DevicePtr, usize)> {
                let mut buffers = Vec::with_capacity(#count);
                #push_buffers
                buffers
            }
        }
    };

    TokenStream::from(expanded)
}
