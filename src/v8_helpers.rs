//! Byte buffer plumbing between `bytes` and V8 array buffers.
//!
//! With the `sandbox` feature V8 must own every backing store, so data is
//! copied into a V8-allocated buffer. Without it the `Vec` becomes the backing
//! store directly.

use bytes::Bytes;

/// An `ArrayBuffer` holding `data`.
pub fn create_array_buffer_from_vec<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    data: Vec<u8>,
) -> v8::Local<'s, v8::ArrayBuffer> {
    if data.is_empty() {
        return v8::ArrayBuffer::new(scope, 0);
    }

    #[cfg(feature = "sandbox")]
    {
        let len = data.len();
        let buffer = v8::ArrayBuffer::new(scope, len);
        let store = buffer.get_backing_store();
        if let Some(ptr) = store.data() {
            // SAFETY: the buffer was just created with `len` bytes and nothing
            // else references it yet.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr() as *mut u8, len);
            }
        }
        buffer
    }

    #[cfg(not(feature = "sandbox"))]
    {
        let store = v8::ArrayBuffer::new_backing_store_from_vec(data).make_shared();
        v8::ArrayBuffer::with_backing_store(scope, &store)
    }
}

/// A `Uint8Array` over a copy of `data`.
pub fn new_uint8_array<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    data: &Bytes,
) -> Option<v8::Local<'s, v8::Uint8Array>> {
    let len = data.len();
    let buffer = create_array_buffer_from_vec(scope, data.to_vec());
    v8::Uint8Array::new(scope, buffer, 0, len)
}

/// Copy the contents of a view (typed array or `DataView`).
pub fn view_bytes(view: v8::Local<'_, v8::ArrayBufferView>) -> Bytes {
    let mut data = vec![0u8; view.byte_length()];
    let copied = view.copy_contents(&mut data);
    data.truncate(copied);
    data.into()
}

/// Copy the whole contents of an `ArrayBuffer`. Detached buffers are empty.
pub fn array_buffer_bytes(buffer: v8::Local<'_, v8::ArrayBuffer>) -> Bytes {
    let store = buffer.get_backing_store();
    let len = store.byte_length();

    match store.data() {
        Some(ptr) if len > 0 => {
            // SAFETY: `store` keeps the memory alive and holds `len` bytes.
            let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const u8, len) };
            Bytes::copy_from_slice(slice)
        }
        _ => Bytes::new(),
    }
}
